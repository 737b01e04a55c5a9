//! Abstract ray-tracing operations, and their mapping onto the runtime library.

use crate::ShaderStage;

pub mod remap;

/// Ray-tracing operation, with its arguments as the instruction inputs.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum RtOp {
    DispatchRaysIndex,
    DispatchRaysDimensions,
    WorldRayOrigin,
    WorldRayDirection,
    ObjectRayOrigin,
    ObjectRayDirection,
    ObjectToWorld,
    WorldToObject,
    RayTmin,
    RayTcurrent,
    RayFlags,
    InstanceId,
    InstanceIndex,
    HitKind,
    PrimitiveIndex,
    GeometryIndex,
    IgnoreHit,
    AcceptHitAndEndSearch,
    TraceRay,
    ReportHit,
    CallCallableShader,

    // NOTE: the following are only lowered by later passes, and can't be
    // remapped onto the runtime library.
    ShaderIndex,
    ShaderRecordBuffer,
    InstanceInclusionMask,
    TriangleVertexPositions,
}

impl RtOp {
    pub const ALL: [RtOp; 25] = [
        RtOp::DispatchRaysIndex,
        RtOp::DispatchRaysDimensions,
        RtOp::WorldRayOrigin,
        RtOp::WorldRayDirection,
        RtOp::ObjectRayOrigin,
        RtOp::ObjectRayDirection,
        RtOp::ObjectToWorld,
        RtOp::WorldToObject,
        RtOp::RayTmin,
        RtOp::RayTcurrent,
        RtOp::RayFlags,
        RtOp::InstanceId,
        RtOp::InstanceIndex,
        RtOp::HitKind,
        RtOp::PrimitiveIndex,
        RtOp::GeometryIndex,
        RtOp::IgnoreHit,
        RtOp::AcceptHitAndEndSearch,
        RtOp::TraceRay,
        RtOp::ReportHit,
        RtOp::CallCallableShader,
        RtOp::ShaderIndex,
        RtOp::ShaderRecordBuffer,
        RtOp::InstanceInclusionMask,
        RtOp::TriangleVertexPositions,
    ];

    pub fn name(self) -> &'static str {
        match self {
            RtOp::DispatchRaysIndex => "dispatch.rays.index",
            RtOp::DispatchRaysDimensions => "dispatch.rays.dimensions",
            RtOp::WorldRayOrigin => "world.ray.origin",
            RtOp::WorldRayDirection => "world.ray.direction",
            RtOp::ObjectRayOrigin => "object.ray.origin",
            RtOp::ObjectRayDirection => "object.ray.direction",
            RtOp::ObjectToWorld => "object.to.world",
            RtOp::WorldToObject => "world.to.object",
            RtOp::RayTmin => "ray.tmin",
            RtOp::RayTcurrent => "ray.tcurrent",
            RtOp::RayFlags => "ray.flags",
            RtOp::InstanceId => "instance.id",
            RtOp::InstanceIndex => "instance.index",
            RtOp::HitKind => "hit.kind",
            RtOp::PrimitiveIndex => "primitive.index",
            RtOp::GeometryIndex => "geometry.index",
            RtOp::IgnoreHit => "ignore.hit",
            RtOp::AcceptHitAndEndSearch => "accept.hit.and.end.search",
            RtOp::TraceRay => "trace.ray",
            RtOp::ReportHit => "report.hit",
            RtOp::CallCallableShader => "call.callable.shader",
            RtOp::ShaderIndex => "shader.index",
            RtOp::ShaderRecordBuffer => "shader.record.buffer",
            RtOp::InstanceInclusionMask => "instance.inclusion.mask",
            RtOp::TriangleVertexPositions => "triangle.vertex.positions",
        }
    }
}

/// How an `RtOp` is implemented by the runtime library.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct GpuRtMapEntry {
    /// Runtime library function name, without the `_cont_` prefix.
    pub name: &'static str,

    /// Whether the implementation takes the (candidate or committed) hit
    /// state as its second argument.
    pub accesses_hit_data: bool,
}

/// Prefix of all runtime library implementations of `RtOp`s.
pub const IMPL_PREFIX: &str = "_cont_";

pub fn gpurt_map_entry(op: RtOp) -> Option<GpuRtMapEntry> {
    let (name, accesses_hit_data) = match op {
        RtOp::InstanceId => ("InstanceID", true),
        RtOp::InstanceIndex => ("InstanceIndex", true),
        RtOp::HitKind => ("HitKind", true),
        RtOp::RayFlags => ("RayFlags", false),
        RtOp::DispatchRaysIndex => ("DispatchRaysIndex3", false),
        RtOp::DispatchRaysDimensions => ("DispatchRaysDimensions3", false),
        RtOp::WorldRayOrigin => ("WorldRayOrigin3", false),
        RtOp::WorldRayDirection => ("WorldRayDirection3", false),
        RtOp::ObjectRayOrigin => ("ObjectRayOrigin3", true),
        RtOp::ObjectRayDirection => ("ObjectRayDirection3", true),
        RtOp::ObjectToWorld => ("ObjectToWorld4x3", true),
        RtOp::WorldToObject => ("WorldToObject4x3", true),
        RtOp::RayTmin => ("RayTMin", false),
        RtOp::RayTcurrent => ("RayTCurrent", true),
        RtOp::IgnoreHit => ("IgnoreHit", false),
        RtOp::AcceptHitAndEndSearch => ("AcceptHitAndEndSearch", false),
        RtOp::TraceRay => ("TraceRay", false),
        RtOp::ReportHit => ("ReportHit", false),
        RtOp::CallCallableShader => ("CallShader", false),
        RtOp::PrimitiveIndex => ("PrimitiveIndex", true),
        RtOp::GeometryIndex => ("GeometryIndex", true),

        RtOp::ShaderIndex
        | RtOp::ShaderRecordBuffer
        | RtOp::InstanceInclusionMask
        | RtOp::TriangleVertexPositions => return None,
    };
    Some(GpuRtMapEntry {
        name,
        accesses_hit_data,
    })
}

/// Whether `op` can be recomputed after a suspend point, instead of having its
/// result saved in the continuation frame.
///
/// Dispatch indices/dimensions never change. The remaining ray/instance
/// queries are only stable in intersection shaders (which can only call
/// `ReportHit`, which keeps the full system data), or when the stage is
/// unknown; `RayTcurrent` is excluded, as `ReportHit` can change it.
pub fn is_rematerializable_rt_op(op: RtOp, stage: Option<ShaderStage>) -> bool {
    if matches!(op, RtOp::DispatchRaysDimensions | RtOp::DispatchRaysIndex) {
        return true;
    }

    matches!(stage, None | Some(ShaderStage::Intersection))
        && matches!(
            op,
            RtOp::InstanceId
                | RtOp::InstanceIndex
                | RtOp::GeometryIndex
                | RtOp::ObjectRayDirection
                | RtOp::ObjectRayOrigin
                | RtOp::ObjectToWorld
                | RtOp::PrimitiveIndex
                | RtOp::RayFlags
                | RtOp::RayTmin
                | RtOp::WorldRayDirection
                | RtOp::WorldRayOrigin
                | RtOp::WorldToObject
        )
}
