//! Metadata model: revisions, handles, and embedded operations

pub mod ops;
pub mod revision;

pub use ops::{AttrChange, BlockUpdate, FolderOp, OpCommon, OpInvertError, WriteRange};
pub use revision::{
    BranchId, FolderHandle, FolderId, ImmutableMd, MdId, MergedStatus, MetadataError,
    RevisionNumber, RootMetadata,
};
