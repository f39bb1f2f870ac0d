pub mod jobs;
pub mod mcp;
pub mod services;
