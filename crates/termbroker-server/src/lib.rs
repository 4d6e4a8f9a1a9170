//! termbroker-server: terminal sessions on PTYs, each with a control socket,
//! a cast recording and a metadata directory under the control dir.

pub mod config;
pub mod process;
pub mod session;
