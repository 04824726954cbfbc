//! The greet service: one method per call pattern plus `SquareRoot`.
//!
//! Layout follows the generated-service convention:
//!
//! ```text
//! greet/
//! ├── types.rs    # request and response messages
//! ├── server.rs   # GreetHandler trait, GreetService, GreetServer
//! └── client.rs   # GreetClient
//! ```

pub mod client;
pub mod server;
pub mod types;

pub use client::GreetClient;
pub use server::{GreetHandler, GreetServer, GreetService, GREET_MANY_TIMES_COUNT};
pub use types::*;

pub const SERVICE_NAME: &str = "GreetService";

/// Fully qualified method names as they appear in the open frame.
pub mod methods {
    pub const GREET: &str = "GreetService.Greet";
    pub const GREET_MANY_TIMES: &str = "GreetService.GreetManyTimes";
    pub const LONG_GREET: &str = "GreetService.LongGreet";
    pub const GREET_EVERYONE: &str = "GreetService.GreetEveryone";
    pub const SQUARE_ROOT: &str = "GreetService.SquareRoot";
}
