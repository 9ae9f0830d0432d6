//! Concurrent dispatch runtime: fleet state, dispatchers and the flight executor.

pub mod config;
pub mod dispatch;
pub mod emergency;
pub mod loops;
pub mod scenario;
pub mod state;
