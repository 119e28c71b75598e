mod watcher;

pub use watcher::{BrowserEvent, MdnsWatcher};
