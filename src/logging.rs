//! Process-wide logging setup. Library code never touches this module; it
//! only emits through `log::{debug,info,warn,error}`. Only the CLI binary
//! calls [`init`], once, at startup.

use log::LevelFilter;
use logforth::append;

pub fn init(level: LevelFilter) {
    logforth::builder()
        .dispatch(|d| d.filter(level).append(append::Stderr::default()))
        .apply();
}
