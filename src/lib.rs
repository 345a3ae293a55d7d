pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod logger;
pub mod pipeline;
pub mod protocol;
pub mod session;
pub mod types;

pub use config::{load_config, load_config_or_default, AcquisitionConfig, AppConfig, SharedConfig};
pub use connection::{ConnectionConfig, TcpTransport, Transport};
pub use dispatcher::{dispatch, Action, ListKind, Phase, Transition};
pub use error::LogicError;
pub use logger::{Direction, Logger, WireLogEntry};
pub use pipeline::{plan, PipelineState, Step, StepPlan};
pub use protocol::{classify, Command, Reply};
pub use session::{
    spawn, LinkEvent, LinkId, Session, SessionEvent, SessionHandle, SessionRunner,
    SessionState, SessionUpdate,
};
pub use types::{DeviceEntry, SampleRate, TriggerMode};
