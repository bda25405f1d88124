pub mod bucket;
pub mod collection;
pub mod dispatch;
pub mod error;
pub mod item;
pub mod observer;
pub mod protocol;
pub mod rest;
pub mod server;
pub mod store;
pub mod tap;
pub mod vbucket;

pub use bucket::{Bucket, BucketSettings, Buckets};
pub use dispatch::ReqHandler;
pub use error::{Result, StoreError};
pub use item::Item;
pub use observer::{Mutation, MutationLogger, MutationObserver};
pub use server::Server;
pub use store::{BucketStore, MemoryOnly, StoreOptions, StoreStats};
pub use tap::{do_tap, TapConfig, TapMessage};
pub use vbucket::{VBState, VBucket};

/// Version stamp assigned to every mutation; the store's logical clock
pub type Cas = u64;

/// Hard cap on partitions per bucket
pub const MAX_VBUCKETS: u16 = 1024;

pub const DEFAULT_BUCKET_NAME: &str = "default";
