use std::fmt;

use vkrt_gpu::ash::vk;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    Hit,
    Miss,
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupKind::Hit => f.write_str("hit"),
            GroupKind::Miss => f.write_str("miss"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Gpu(#[from] vkrt_gpu::Error),

    #[error("mesh {mesh} has no bottom level acceleration structure")]
    BottomLevelNotBuilt { mesh: usize },

    #[error("mesh {name:?} has no vertices or no indices")]
    EmptyGeometry { name: String },

    #[error("mesh {name:?} has {count} indices, which is not a whole number of triangles")]
    MalformedIndices { name: String, count: usize },

    #[error("mesh {name:?} references vertex {index} but has {vertices} vertices")]
    IndexOutOfRange {
        name: String,
        index: u32,
        vertices: usize,
    },

    #[error("mesh {name:?} has {attributes} vertex attributes for {vertices} vertices")]
    AttributeCountMismatch {
        name: String,
        vertices: usize,
        attributes: usize,
    },

    #[error("invalid shader group layout: {handle_size} byte handles, {alignment} byte alignment")]
    InvalidLayout { handle_size: u32, alignment: u32 },

    #[error("expected {expected} bytes of shader group handles, the device returned {actual}")]
    HandleSizeMismatch { expected: usize, actual: usize },

    #[error("the raygen stage has to be set first")]
    RaygenNotSet,

    #[error("the raygen stage was already set")]
    RaygenAlreadySet,

    #[error("{kind} group {index} is out of range ({count} groups)")]
    GroupIndexOutOfRange {
        kind: GroupKind,
        index: u32,
        count: u32,
    },

    #[error("{kind} group {index} was already populated")]
    GroupAlreadyPopulated { kind: GroupKind, index: u32 },

    #[error("{kind} group {index} was never populated")]
    UnpopulatedGroup { kind: GroupKind, index: u32 },

    #[error("a hit group takes 1 to 3 stages, got {0}")]
    InvalidStageCount(usize),

    #[error("a {kind} group cannot hold a {stage:?} stage")]
    StageKindMismatch {
        kind: &'static str,
        stage: vk::ShaderStageFlags,
    },

    #[error("a hit group holds at most one {0:?} stage")]
    DuplicateHitStage(vk::ShaderStageFlags),

    #[error("the shader binding table has not been created")]
    NotBaked,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
