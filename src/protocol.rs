use crate::types::{SampleRate, TriggerMode};
use std::fmt;
use std::time::Duration;

// Protocol constants
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 10429;
pub const FRAME_TERMINATOR: u8 = 0;
pub const ACK: &str = "ACK";
pub const NAK: &str = "NAK";
pub const COMPLETE_MARKER: &str = "TRUE";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Requests understood by the Logic socket API.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    GetConnectedDevices,
    SelectActiveDevice { index: String },
    GetAllSampleRates,
    SetSampleRate(SampleRate),
    SetActiveChannels { trigger_channel: u32, analog_channels: Vec<u32> },
    SetTrigger(TriggerMode),
    SetNumSamples(u64),
    SetPretriggerBufferSize(u64),
    Capture,
    ExportData { path: String, channel: u32 },
    IsProcessingComplete,
}

impl Command {
    /// Bytes written to the socket: text payload followed by the terminator.
    pub fn frame(&self) -> Vec<u8> {
        let mut bytes = self.to_string().into_bytes();
        bytes.push(FRAME_TERMINATOR);
        bytes
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::GetConnectedDevices => f.write_str("get_connected_devices"),
            Command::SelectActiveDevice { index } => write!(f, "select_active_device,{index}"),
            Command::GetAllSampleRates => f.write_str("get_all_sample_rates"),
            Command::SetSampleRate(rate) => write!(f, "set_sample_rate,{rate}"),
            Command::SetActiveChannels {
                trigger_channel,
                analog_channels,
            } => {
                write!(
                    f,
                    "set_active_channels,digital_channels,{trigger_channel},analog_channels"
                )?;
                for channel in analog_channels {
                    write!(f, ",{channel}")?;
                }
                Ok(())
            }
            Command::SetTrigger(mode) => write!(f, "set_trigger,{mode}"),
            Command::SetNumSamples(n) => write!(f, "set_num_samples,{n}"),
            Command::SetPretriggerBufferSize(n) => {
                write!(f, "set_capture_pretrigger_buffer_size,{n}")
            }
            Command::Capture => f.write_str("capture"),
            Command::ExportData { path, channel } => write!(
                f,
                "export_data,{path},analog_channels,{channel},voltage,all_time,binary,each_sample,32"
            ),
            Command::IsProcessingComplete => f.write_str("is_processing_complete"),
        }
    }
}

/// Coarse meaning of a reply payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Exactly the negative acknowledgment literal.
    Nak,
    /// Contains the processing-complete marker.
    Complete,
    /// Anything else, treated as a positive acknowledgment.
    Ack,
}

/// Strip terminator bytes and surrounding whitespace from a raw payload.
pub fn normalize(payload: &str) -> &str {
    payload.trim_matches(|c: char| c == '\0' || c.is_whitespace())
}

/// Classify a reply. Matching is textual: an exact `NAK`, otherwise any
/// payload containing `TRUE` counts as complete.
pub fn classify(payload: &str) -> Reply {
    let payload = normalize(payload);
    if payload == NAK {
        Reply::Nak
    } else if payload.contains(COMPLETE_MARKER) {
        Reply::Complete
    } else {
        Reply::Ack
    }
}

/// Parse a list payload into selectable entries, led by an empty entry.
pub fn parse_list(payload: &str) -> Vec<String> {
    let mut entries = vec![String::new()];
    entries.extend(
        payload
            .split('\n')
            .map(|token| token.trim_matches(|c: char| c == '\0' || c == '\r'))
            .filter(|token| !token.trim().is_empty() && token.trim() != ACK)
            .map(str::to_string),
    );
    entries
}

/// Whether an accumulated reply has been fully received.
///
/// Every reply, list or not, ends with an `ACK` or `NAK` line; a read may
/// deliver only part of it.
pub fn reply_complete(buffer: &str) -> bool {
    buffer
        .split('\n')
        .map(normalize)
        .filter(|line| !line.is_empty())
        .last()
        .is_some_and(|line| line == ACK || line == NAK)
}
