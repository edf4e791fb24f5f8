//! Side-effecting adapters: filesystem, git, subprocesses, forge, planner.

pub mod atomic;
pub mod backlog;
pub mod config;
pub mod context;
pub mod forge;
pub mod git;
pub mod init;
pub mod lock;
pub mod planner;
pub mod process;
pub mod prompt;
pub mod run_log;
pub mod verify;
pub mod worktree;
