//! meshgate: cluster RPC routing and portable gate sessions
//!
//! Stateless module nodes call each other by service name through the
//! [`selector`] and [`rpc`] layers, while gate nodes own the client
//! connections and let any node act on them through an exported
//! [`gate::Session`].
pub mod api;
pub mod app;
pub mod cli;
pub mod error;
pub mod gate;
pub mod registry;
pub mod rpc;
pub mod selector;
pub mod settings;
pub mod status;

pub use app::App;
pub use error::{MeshError, Result};
