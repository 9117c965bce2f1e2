// This module is used from multiple different test files, each of which
// gets compiled into its own binary. Not all the binaries use all the
// stuff here.
#![allow(dead_code)]

use std::{path::PathBuf, time};

use anyhow::anyhow;

pub fn netlogind_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_netlogind"))
}

/// Most of the daemon's interesting behavior needs real credentials
/// to exercise; tests that transition uids bail out early on
/// unprivileged runs.
pub fn is_root() -> bool {
    nix::unistd::Uid::effective().is_root()
}

pub fn wait_until<P>(mut pred: P) -> anyhow::Result<()>
where
    P: FnMut() -> anyhow::Result<bool>,
{
    let mut sleep_dur = time::Duration::from_millis(5);
    for _ in 0..12 {
        if pred()? {
            return Ok(());
        } else {
            std::thread::sleep(sleep_dur);
            sleep_dur *= 2;
        }
    }

    Err(anyhow!("pred never became true"))
}
