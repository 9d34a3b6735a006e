use thiserror::Error;

/// Guest memory access outside the backing region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("guest memory access out of range: addr={addr:#010x} len={len}")]
pub struct MemoryError {
    pub addr: u32,
    pub len: usize,
}

/// Malformed descriptor structures found while walking host-stack owned lists.
///
/// These are configuration errors on the host stack side: the controller reports them as an
/// UnrecoverableError interrupt rather than following the offending link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DescriptorError {
    #[error("descriptor pointer {0:#010x} is not 16-byte aligned")]
    Misaligned(u32),
    #[error("descriptor pointer {0:#010x} lies outside descriptor memory")]
    OutOfArena(u32),
    #[error("descriptor at {0:#010x} links to itself")]
    SelfLink(u32),
    #[error("descriptor list cycle detected at {0:#010x}")]
    Cycle(u32),
    #[error("descriptor list exceeds {0} entries")]
    ListTooLong(usize),
    #[error("TD buffer range {cbp:#010x}..={be:#010x} is inverted or too long")]
    BufferRange { cbp: u32, be: u32 },
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("interrupt_workers must be between 1 and {max} (got {got})")]
    InterruptWorkers { got: usize, max: usize },
    #[error("{0} must be non-zero")]
    ZeroTimeout(&'static str),
    #[error("hub_ports must be between 1 and {max} (got {got})")]
    HubPorts { got: usize, max: usize },
    #[error("pipe {0} is bound more than once")]
    DuplicatePipe(u8),
    #[error("pipe 0 is reserved for the control pipe")]
    ReservedPipe,
    #[error("endpoint {0} is out of range")]
    Endpoint(u8),
    #[error("pipe {0} must be bound as bulk or interrupt")]
    ControlBinding(u8),
}

#[derive(Debug, Error)]
pub enum OhciError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}
