pub mod server;

pub use server::{parse_service_addr, ServiceClient, DEFAULT_TIMEOUT};
