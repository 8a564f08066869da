use ash::vk;

/// Failures reported by a [`crate::RayTracingDevice`]. None of these are retried.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to query acceleration structure build sizes: {0}")]
    SizeQuery(vk::Result),

    #[error("failed to allocate {what} of {size} bytes: {result}")]
    Allocation {
        what: &'static str,
        size: vk::DeviceSize,
        result: vk::Result,
    },

    #[error("buffer {0:?} was not created by this device")]
    UnknownBuffer(vk::Buffer),

    #[error("buffer {0:?} is not host visible")]
    NotHostVisible(vk::Buffer),

    #[error("write of {len} bytes at offset {offset} overflows a buffer of {size} bytes")]
    WriteOutOfBounds {
        offset: vk::DeviceSize,
        len: usize,
        size: vk::DeviceSize,
    },

    #[error("command submission failed: {0}")]
    Submission(vk::Result),

    #[error("failed to retrieve shader group handles: {0}")]
    ShaderGroupHandles(vk::Result),

    #[error("failed to load the Vulkan library: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("invalid SPIR-V: {0}")]
    InvalidSpirv(#[from] std::io::Error),

    #[error("{0}")]
    Unsupported(String),

    #[error(transparent)]
    Vk(#[from] vk::Result),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
