pub mod app;
pub mod codec;
pub mod net;
pub mod pipeline;
pub mod session;
