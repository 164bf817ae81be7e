mod makecache;
mod tags;
mod utils;
