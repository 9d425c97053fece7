mod local;

pub use local::LocalShelvesetStore;
