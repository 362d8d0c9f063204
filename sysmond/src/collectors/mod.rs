pub mod cpu;
pub mod memory;
pub mod network;
pub mod process;
pub mod process_source;

pub use cpu::CpuSampler;
pub use memory::MemorySampler;
pub use network::NetworkSampler;
pub use process::{ProcessSampler, ProcessSamplerSettings};
pub use process_source::{ProcessDataProvider, ProcfsProcessProvider};
