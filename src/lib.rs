pub mod agent;
pub mod browser;
pub mod computer;
pub mod config;
pub mod events;
pub mod manager;
pub mod model;
pub mod ollama;
pub mod prompts;
pub mod protocol;
pub mod session;

pub use agent::{FailureCause, Operator, Outcome};
pub use browser::BrowserConfig;
pub use computer::{ActionExecutor, ChromiumDesktop, NoopDesktop, ScreenAnnotator, ScreenCapture};
pub use config::OperateConfig;
pub use events::{EventBus, OperatorEvent};
pub use manager::{ManagerError, SessionLogs, SessionManager};
pub use model::{ModelClient, VisionModel};
pub use ollama::OllamaClient;
pub use protocol::{parse_operations, Operation};
pub use session::{ActionLog, Session, SessionStatus};
