mod options_watcher;

pub use options_watcher::OptionsWatcher;
