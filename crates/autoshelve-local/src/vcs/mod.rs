mod git;

pub use git::GitBackend;
