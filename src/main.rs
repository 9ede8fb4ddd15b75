use std::process::ExitCode;

mod app;
mod backup;
mod cli;
mod config;
mod error;
mod filter;
mod lock;
mod logger;
mod queue;
mod render;
mod store;
mod task_types;
mod transfer;
mod workspace;


fn main() -> ExitCode {
    app::main()
}
