pub mod error;
pub mod routes;
pub mod state;
pub mod ws_connection;

pub use error::ApiError;
pub use routes::router;
pub use state::AppState;
