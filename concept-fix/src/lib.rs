pub mod diagnosis;
pub mod error;
pub mod gateway;
pub mod session;

// Re-export commonly used types
pub use diagnosis::{Diagnosis, Evaluation, RootCause};
pub use error::{GatewayError, Result};
pub use gateway::{DEFAULT_MODEL, ModelGateway, OpenRouterGateway};
pub use session::{
    GENERIC_FAILURE_MESSAGE, Phase, SessionController, SessionError, SessionView,
};
