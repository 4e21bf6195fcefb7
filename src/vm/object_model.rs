use crate::util::ObjectReference;

/// Object layout queries. The collector only needs to know where an object ends.
pub trait ObjectModel: Send + Sync {
    /// The size of `object` in bytes, a multiple of
    /// [`DEFAULT_OBJECT_ALIGNMENT`](crate::vm::DEFAULT_OBJECT_ALIGNMENT). The object occupies
    /// `[object, object + size)`.
    fn object_size(&self, object: ObjectReference) -> usize;
}
