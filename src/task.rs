use crate::{
    backend::Kernel,
    config::Config,
    types::{Event, Handler},
};
use core::{fmt, ops::Range};
use std::{borrow::Cow, sync::Arc};
use thiserror::Error;

/// Body of a splittable range task. Called once per disjoint sub-range.
pub type RangeBody<C> = Arc<dyn Fn(Range<usize>, &mut Handler<C>) + Send + Sync>;

/// The work a graph node runs once all of its predecessors have completed.
pub enum Work<C: Config> {
    /// Submitted to the backend; the closure receives the device-submission
    /// context.
    Kernel(Kernel<C::Backend>),
    /// Called directly on a worker. Returns the completion handle of the
    /// asynchronous call it started, or `None` if it already finished.
    Host(Box<dyn FnOnce() -> Option<Event<C>> + Send>),
    /// Kernel over an index range that workers may split for load balancing.
    Range {
        range: Range<usize>,
        body: RangeBody<C>,
    },
}

impl<C: Config> Work<C> {
    pub fn kernel(f: impl FnOnce(&mut Handler<C>) + Send + 'static) -> Self {
        Self::Kernel(Box::new(f))
    }

    pub fn host(f: impl FnOnce() -> Option<Event<C>> + Send + 'static) -> Self {
        Self::Host(Box::new(f))
    }

    pub fn range(
        range: Range<usize>,
        body: impl Fn(Range<usize>, &mut Handler<C>) + Send + Sync + 'static,
    ) -> Self {
        Self::Range {
            range,
            body: Arc::new(body),
        }
    }

    /// Whether this work may be split across workers.
    pub fn is_splittable(&self) -> bool {
        matches!(self, Self::Range { .. })
    }
}

impl<C: Config> fmt::Debug for Work<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kernel(_) => f.write_str("Work::Kernel"),
            Self::Host(_) => f.write_str("Work::Host"),
            Self::Range { range, .. } => write!(f, "Work::Range({range:?})"),
        }
    }
}

/// Maximum number of packed parameters in a [`TaskMetadata`] record.
pub const MAX_TASK_PARAMS: usize = 8;

#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum MetadataError {
    /// More than [`MAX_TASK_PARAMS`] parameters were added.
    #[error("task metadata holds at most {MAX_TASK_PARAMS} parameters")]
    TooManyParams,
}

/// A scalar parameter packed into 64 bits.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct PackedScalar(pub u64);

impl PackedScalar {
    pub fn as_f64(self) -> f64 {
        f64::from_bits(self.0)
    }

    pub fn as_i64(self) -> i64 {
        self.0 as i64
    }
}

impl From<u64> for PackedScalar {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<i64> for PackedScalar {
    fn from(value: i64) -> Self {
        Self(value as u64)
    }
}

impl From<u32> for PackedScalar {
    fn from(value: u32) -> Self {
        Self(u64::from(value))
    }
}

impl From<usize> for PackedScalar {
    fn from(value: usize) -> Self {
        Self(value as u64)
    }
}

impl From<f64> for PackedScalar {
    fn from(value: f64) -> Self {
        Self(value.to_bits())
    }
}

impl From<f32> for PackedScalar {
    fn from(value: f32) -> Self {
        Self(f64::from(value).to_bits())
    }
}

/// Fixed-size profiling record attached to a task.
///
/// Carried for inspection; the node always runs the work it was given.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskMetadata {
    name: Cow<'static, str>,
    op_id: u32,
    params: [PackedScalar; MAX_TASK_PARAMS],
    len: u8,
}

impl TaskMetadata {
    pub fn new(name: impl Into<Cow<'static, str>>, op_id: u32) -> Self {
        Self {
            name: name.into(),
            op_id,
            params: [PackedScalar(0); MAX_TASK_PARAMS],
            len: 0,
        }
    }

    /// Append one parameter.
    ///
    /// # Errors
    /// If the record already holds [`MAX_TASK_PARAMS`] parameters.
    pub fn with_param(mut self, param: impl Into<PackedScalar>) -> Result<Self, MetadataError> {
        let slot = self
            .params
            .get_mut(self.len as usize)
            .ok_or(MetadataError::TooManyParams)?;
        *slot = param.into();
        self.len += 1;
        Ok(self)
    }

    /// # Errors
    /// If more than [`MAX_TASK_PARAMS`] parameters are given in total.
    pub fn with_params<P: Into<PackedScalar>>(
        self,
        params: impl IntoIterator<Item = P>,
    ) -> Result<Self, MetadataError> {
        params
            .into_iter()
            .try_fold(self, |meta, param| meta.with_param(param))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn op_id(&self) -> u32 {
        self.op_id
    }

    pub fn params(&self) -> &[PackedScalar] {
        &self.params[..self.len as usize]
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn packs_mixed_scalars() {
        let meta = TaskMetadata::new("axpy", 7)
            .with_param(2.5f64)
            .and_then(|m| m.with_param(-3i64))
            .and_then(|m| m.with_param(1024usize))
            .unwrap();
        assert_eq!(meta.name(), "axpy");
        assert_eq!(meta.op_id(), 7);
        let params = meta.params();
        assert_eq!(params.len(), 3);
        assert_eq!(params[0].as_f64(), 2.5);
        assert_eq!(params[1].as_i64(), -3);
        assert_eq!(params[2], PackedScalar(1024));
    }

    #[test]
    fn ninth_param_is_rejected() {
        let full = TaskMetadata::new("gemm", 1)
            .with_params(0u64..8)
            .unwrap();
        assert_eq!(full.params().len(), MAX_TASK_PARAMS);
        assert_eq!(full.with_param(9u64), Err(MetadataError::TooManyParams));
    }
}
