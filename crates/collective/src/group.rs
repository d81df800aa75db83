//! Process group trait definition
//!
//! Every method is a blocking collective: the caller suspends until all ranks
//! in the group issue the matching call. Ranks must issue collectives in the
//! same order or the group deadlocks (or, for [`crate::LocalGroup`], times out).

use serde::de::DeserializeOwned;
use serde::Serialize;
use shard_core::{Device, Error, Rank, Result, Tensor};

/// Blocking collective transport
///
/// Implementors provide the raw tensor, counter and byte collectives. Typed
/// object collectives come from [`ObjectCollectives`].
pub trait ProcessGroup: Send + Sync {
    /// Rank of the calling process
    fn rank(&self) -> Rank;

    /// Number of ranks in the group
    fn world_size(&self) -> usize;

    /// Device that tensor collectives operate on
    fn default_device(&self) -> Device;

    /// Number of accelerator devices visible to this process
    fn device_count(&self) -> usize {
        1
    }

    /// Gather every rank's `input` into `output`, concatenated in rank order
    ///
    /// # Arguments
    /// * `output` - Buffer holding `world_size * input.numel()` elements
    /// * `input` - This rank's contribution
    ///
    /// # Errors
    /// Returns error if sizes or dtypes disagree across ranks
    fn all_gather_into_tensor(&self, output: &mut Tensor, input: &Tensor) -> Result<()>;

    /// Overwrite `tensor` on every rank with the value held by `src`
    fn broadcast(&self, tensor: &mut Tensor, src: Rank) -> Result<()>;

    /// Sum a counter across ranks
    fn all_reduce_sum(&self, value: i64) -> Result<i64>;

    /// Gather one byte payload per rank, indexed by rank
    fn all_gather_bytes(&self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>>;

    /// Broadcast `payload` from `src`; non-source ranks pass `None`
    fn broadcast_bytes(&self, payload: Option<Vec<u8>>, src: Rank) -> Result<Vec<u8>>;
}

/// Typed object collectives, bincode-encoded over the byte collectives
pub trait ObjectCollectives: ProcessGroup {
    /// Gather one object per rank, indexed by rank
    fn all_gather_object<T>(&self, value: &T) -> Result<Vec<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        let payload = bincode::serialize(value)?;
        self.all_gather_bytes(payload)?
            .iter()
            .map(|bytes| bincode::deserialize::<T>(bytes).map_err(Error::from))
            .collect()
    }

    /// Broadcast an object from `src`; non-source ranks pass `None`
    fn broadcast_object<T>(&self, value: Option<&T>, src: Rank) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        let payload = match value {
            Some(v) if self.rank() == src => Some(bincode::serialize(v)?),
            _ => None,
        };
        let bytes = self.broadcast_bytes(payload, src)?;
        Ok(bincode::deserialize(&bytes)?)
    }
}

impl<G: ProcessGroup + ?Sized> ObjectCollectives for G {}
