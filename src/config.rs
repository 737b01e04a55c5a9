//! Lowering configuration, validated once from module metadata.

use crate::cont::StackPointerMode;
use crate::{AddrSpace, LowerError, Module};

/// Metadata keys read by `LoweringConfig::from_module_metadata`.
pub mod keys {
    /// Address space index (`5` for scratch, `1` for global) of the
    /// continuation stack.
    pub const STACK_ADDR_SPACE: &str = "continuation.stackAddrspace";
    pub const FLAGS: &str = "continuation.flags";
    pub const RTIP: &str = "continuation.rtip";

    /// Major version of the targeted graphics IP.
    pub const GFX_IP: &str = "lgc.gfxip";

    /// `[x, y, z]`, only present for compute pipelines.
    pub const WORKGROUP_SIZE: &str = "lgc.workgroup.size";

    pub const BOX_SORT_HEURISTIC_MODE: &str = "lgc.rt.boxSortHeuristicMode";
    pub const STATIC_PIPELINE_FLAGS: &str = "lgc.rt.staticPipelineFlags";
    pub const TRI_COMPRESS_MODE: &str = "lgc.rt.triCompressMode";
}

/// Graphics IP version assumed when `lgc.gfxip` is absent.
pub const DEFAULT_GFX_IP_MAJOR: u32 = 10;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum PipelineKind {
    Graphics,
    Compute { workgroup_size: [u32; 3] },
}

/// Pipeline-wide ray-tracing options, queried by shaders through the GPU
/// ray-tracing runtime.
#[derive(Copy, Clone, Default, PartialEq, Eq, Debug)]
pub struct RtOptions {
    pub box_sort_heuristic_mode: u32,
    pub static_pipeline_flags: u32,
    pub tri_compress_mode: u32,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct LoweringConfig {
    pub stack_mode: Option<StackPointerMode>,
    pub flags: Option<u32>,
    pub rtip: Option<u32>,
    pub gfx_ip_major: u32,
    pub pipeline: PipelineKind,
    pub rt_options: RtOptions,
}

impl Default for LoweringConfig {
    fn default() -> Self {
        Self {
            stack_mode: None,
            flags: None,
            rtip: None,
            gfx_ip_major: DEFAULT_GFX_IP_MAJOR,
            pipeline: PipelineKind::Graphics,
            rt_options: RtOptions::default(),
        }
    }
}

fn single_u32(module: &Module, key: &'static str) -> Result<Option<u32>, LowerError> {
    match module.metadata_u32s(key) {
        None => Ok(None),
        Some(&[value]) => Ok(Some(value)),
        Some(values) => Err(LowerError::InvalidMetadata {
            key,
            reason: format!("expected a single value, found {}", values.len()),
        }),
    }
}

impl LoweringConfig {
    pub fn from_module_metadata(module: &Module) -> Result<Self, LowerError> {
        let stack_mode = single_u32(module, keys::STACK_ADDR_SPACE)?
            .map(|idx| match AddrSpace::from_index(idx) {
                Some(AddrSpace::Scratch) => Ok(StackPointerMode::Scratch),
                Some(AddrSpace::Global) => Ok(StackPointerMode::Global),
                _ => Err(LowerError::InvalidMetadata {
                    key: keys::STACK_ADDR_SPACE,
                    reason: format!("unsupported continuation stack address space {idx}"),
                }),
            })
            .transpose()?;

        let pipeline = match module.metadata_u32s(keys::WORKGROUP_SIZE) {
            None => PipelineKind::Graphics,
            Some(&[x, y, z]) if x > 0 && y > 0 && z > 0 => {
                if !crate::gpurt::workgroup_dims_fit_lds_stack([x, y, z]) {
                    return Err(LowerError::InvalidMetadata {
                        key: keys::WORKGROUP_SIZE,
                        reason: format!("workgroup of {x}x{y}x{z} threads is too large"),
                    });
                }
                PipelineKind::Compute {
                    workgroup_size: [x, y, z],
                }
            }
            Some(values) => {
                return Err(LowerError::InvalidMetadata {
                    key: keys::WORKGROUP_SIZE,
                    reason: format!("expected three non-zero dimensions, found {values:?}"),
                })
            }
        };

        let config = Self {
            stack_mode,
            flags: single_u32(module, keys::FLAGS)?,
            rtip: single_u32(module, keys::RTIP)?,
            gfx_ip_major: single_u32(module, keys::GFX_IP)?.unwrap_or(DEFAULT_GFX_IP_MAJOR),
            pipeline,
            rt_options: RtOptions {
                box_sort_heuristic_mode: single_u32(module, keys::BOX_SORT_HEURISTIC_MODE)?
                    .unwrap_or(0),
                static_pipeline_flags: single_u32(module, keys::STATIC_PIPELINE_FLAGS)?
                    .unwrap_or(0),
                tri_compress_mode: single_u32(module, keys::TRI_COMPRESS_MODE)?.unwrap_or(0),
            },
        };
        log::debug!("lowering config: {config:?}");
        Ok(config)
    }

    /// The continuation stack addressing mode, defaulting to `Scratch`.
    pub fn stack_mode_or_default(&self) -> StackPointerMode {
        self.stack_mode.unwrap_or(StackPointerMode::Scratch)
    }

    pub fn flags(&self) -> Result<u32, LowerError> {
        self.flags.ok_or(LowerError::MissingMetadata(keys::FLAGS))
    }

    pub fn rtip(&self) -> Result<u32, LowerError> {
        self.rtip.ok_or(LowerError::MissingMetadata(keys::RTIP))
    }
}
