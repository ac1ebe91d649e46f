//! RCSP wire protocol: framing, typed commands/responses and the session
//! layer that correlates them.

pub mod command;
pub mod frame;
pub mod response;
pub mod session;
