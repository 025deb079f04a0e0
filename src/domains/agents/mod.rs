pub mod decoder;
pub mod detector;
pub mod manager;
pub mod session;

pub use decoder::{AgentMessage, FrameDecoder};
pub use detector::{AgentDetection, CliDetector, ResolvedAgent};
pub use manager::{AgentManager, AgentStartOptions};
pub use session::{AgentSession, AgentSessionInfo, AgentState};
