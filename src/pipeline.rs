//! Acquisition step sequencer
//!
//! Every command of an acquisition is one [`Step`]. Planning a step is a pure
//! function of the current [`PipelineState`] and the live
//! [`AcquisitionConfig`]: it yields the command to send, the step to run once
//! the device acknowledges it, and whether the device must report finished
//! processing before that happens.
//!
//! ```text
//! SelectDevice -> FetchSampleRates            (rate list, operator picks)
//! SetSampleRate                               (terminal)
//! BeginAcquire -> SetTrigger -> SetSampleCount -> SetPretrigger
//!              -> Capture* -> ExportChannel* x channel_count -> [BeginAcquire]
//! ```
//! Steps marked `*` wait for the completion poll before advancing.

use std::path::Path;

use crate::config::AcquisitionConfig;
use crate::error::LogicError;
use crate::protocol::Command;
use crate::types::{DeviceEntry, SampleRate};

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    SelectDevice(DeviceEntry),
    FetchSampleRates,
    SetSampleRate(SampleRate),
    BeginAcquire,
    SetTrigger,
    SetSampleCount,
    SetPretrigger,
    Capture,
    ExportChannel,
}

impl Step {
    /// Status prefix shown while the step's command is outstanding
    pub fn label(&self) -> String {
        match self {
            Step::SelectDevice(_) => "Select active device: ".to_string(),
            Step::FetchSampleRates => "Get sample rates: ".to_string(),
            Step::SetSampleRate(_) => "Select sample rate: ".to_string(),
            Step::BeginAcquire => "Set active channels: ".to_string(),
            Step::SetTrigger => "Set trigger: ".to_string(),
            Step::SetSampleCount => "Set number of samples: ".to_string(),
            Step::SetPretrigger => "Set pre-trigger: ".to_string(),
            Step::Capture => "Capture: ".to_string(),
            Step::ExportChannel => "Exporting channel: ".to_string(),
        }
    }
}

/// Per-sequence state threaded through every transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineState {
    pub continuation: Option<Step>,
    pub await_completion: bool,
    pub export_cursor: u32,
}

/// Everything needed to issue one step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepPlan {
    pub state: PipelineState,
    pub command: Command,
    pub status: String,
    /// Replacement base path once the last channel of a run is exported
    pub next_output_path: Option<String>,
}

/// Plan `step` against `state` and the current acquisition settings.
pub fn plan(
    step: Step,
    state: PipelineState,
    config: &AcquisitionConfig,
) -> Result<StepPlan, LogicError> {
    let mut status = step.label();
    let mut next_output_path = None;
    let mut state = state;

    let command = match step {
        Step::SelectDevice(entry) => {
            state.continuation = Some(Step::FetchSampleRates);
            Command::SelectActiveDevice { index: entry.index }
        }
        Step::FetchSampleRates => {
            state.continuation = None;
            Command::GetAllSampleRates
        }
        Step::SetSampleRate(rate) => {
            state.continuation = None;
            Command::SetSampleRate(rate)
        }
        Step::BeginAcquire => {
            state = PipelineState {
                continuation: Some(Step::SetTrigger),
                ..PipelineState::default()
            };
            Command::SetActiveChannels {
                trigger_channel: config.trigger_channel,
                analog_channels: (0..config.channel_count).collect(),
            }
        }
        Step::SetTrigger => {
            state.continuation = Some(Step::SetSampleCount);
            Command::SetTrigger(config.trigger_mode)
        }
        Step::SetSampleCount => {
            state.continuation = Some(Step::SetPretrigger);
            Command::SetNumSamples(scaled_sample_count(
                config.sample_count,
                config.digital_rate,
                config.analog_rate,
            )?)
        }
        Step::SetPretrigger => {
            state.continuation = Some(Step::Capture);
            Command::SetPretriggerBufferSize(config.pretrigger_size)
        }
        Step::Capture => {
            state.continuation = Some(Step::ExportChannel);
            state.await_completion = true;
            state.export_cursor = 0;
            Command::Capture
        }
        Step::ExportChannel => {
            let channel = state.export_cursor;
            let path = channel_export_path(&config.output_path, channel);
            status = format!("Exporting channel {channel}: ");

            state.export_cursor += 1;
            state.await_completion = true;
            if state.export_cursor < config.channel_count {
                state.continuation = Some(Step::ExportChannel);
            } else {
                state.continuation = config.repeat.then_some(Step::BeginAcquire);
                next_output_path = advance_output_path(&config.output_path);
            }
            Command::ExportData { path, channel }
        }
    };

    Ok(StepPlan {
        state,
        command,
        status,
        next_output_path,
    })
}

/// Samples to request at the digital rate for `sample_count` analog samples.
pub fn scaled_sample_count(
    sample_count: u64,
    digital_rate: f64,
    analog_rate: f64,
) -> Result<u64, LogicError> {
    if !(analog_rate > 0.0) || !(digital_rate > 0.0) {
        return Err(LogicError::InvalidSampleRate(format!(
            "{digital_rate},{analog_rate} (select a sample rate first)"
        )));
    }
    Ok((sample_count as f64 * digital_rate / analog_rate).round() as u64)
}

/// Split a file name at its first dot, as `run.tar.001` -> (`run`, `tar.001`).
fn split_file_name(file_name: &str) -> (&str, Option<&str>) {
    match file_name.split_once('.') {
        Some((stem, suffix)) => (stem, Some(suffix)),
        None => (file_name, None),
    }
}

fn with_file_name(base: &str, file_name: &str) -> String {
    match Path::new(base).parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.join(file_name).display().to_string(),
        _ => file_name.to_string(),
    }
}

/// Export path of one channel: `<dir>/<stem>_<channel>.<suffix>`.
pub fn channel_export_path(base: &str, channel: u32) -> String {
    let file_name = Path::new(base)
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    let (stem, suffix) = split_file_name(&file_name);
    let name = match suffix {
        Some(suffix) => format!("{stem}_{channel}.{suffix}"),
        None => format!("{stem}_{channel}"),
    };
    with_file_name(base, &name)
}

/// Bump a numeric extension keeping its width: `run.009` -> `run.010`.
///
/// Returns `None` when the extension is not a number.
pub fn advance_output_path(base: &str) -> Option<String> {
    let file_name = Path::new(base).file_name()?.to_string_lossy().into_owned();
    let (stem, suffix) = split_file_name(&file_name);
    let suffix = suffix?;
    if suffix.is_empty() || !suffix.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let next = suffix.parse::<u64>().ok()?.checked_add(1)?;
    let name = format!("{stem}.{next:0width$}", width = suffix.len());
    Some(with_file_name(base, &name))
}
