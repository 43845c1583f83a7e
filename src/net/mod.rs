pub mod route;
pub mod server;

pub use route::{Route, RouteError, RouteTable};
pub use server::Server;
