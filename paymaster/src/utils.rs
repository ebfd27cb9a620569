//{{ Paymaster }}
//Copyright (C) {{ 2021,2022,2023,2024 }}  {{ Blockstream }}

//This program is free software: you can redistribute it and/or modify
//it under the terms of the GNU Affero General Public License as published by
//the Free Software Foundation, either version 3 of the License, or
//(at your option) any later version.

//This program is distributed in the hope that it will be useful,
//but WITHOUT ANY WARRANTY; without even the implied warranty of
//MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
//GNU Affero General Public License for more details.

//You should have received a copy of the GNU Affero General Public License
//along with this program.  If not, see <http://www.gnu.org/licenses/>.


//! # Utility Functions
//!

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use std::{cmp, fs, io, thread};

use common::constants;

/// Export some serializable object to a file: write a sibling file, flush
/// it to stable storage, then rename it over the target. After this
/// returns `Ok` the new content survives both process and OS crash.
pub fn export_to_file<F>(file: &str, export_fn: F) -> io::Result<()>
    where F: FnOnce(&mut io::BufWriter<fs::File>) -> io::Result<()>
{
    let mut temp_name = file.to_owned();
    temp_name.push_str(".0");
    let fh = match fs::File::create(&temp_name) {
        Ok(fh) => fh,
        Err(e) => {
            slog!(CreateFailed, filename: &temp_name, error: e.to_string());
            return Err(e);
        }
    };
    let mut wr = io::BufWriter::new(fh);
    if let Err(e) = export_fn(&mut wr).and_then(|_| wr.flush()) {
        slog!(WriteFailed, filename: &temp_name, error: e.to_string());
        return Err(e);
    }
    if let Err(e) = wr.get_ref().sync_all() {
        slog!(SyncFailed, filename: &temp_name, error: e.to_string());
        return Err(e);
    }
    drop(wr);
    if let Err(e) = fs::rename(&temp_name, file) {
        slog!(MoveFailed, old_filename: &temp_name, new_filename: file,
            error: e.to_string()
        );
        return Err(e);
    }
    Ok(())
}

/// A cancellation handle shared between the daemon's entry point and the
/// driver/engine loops. Once requested, shutdown is permanent.
#[derive(Clone)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
}

impl Shutdown {
    /// Create a new handle with shutdown not requested.
    pub fn new() -> Shutdown {
        Shutdown {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request shutdown. Loops observe it at their next checkpoint.
    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether shutdown has been requested.
    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep for `dur`, waking early when shutdown is requested.
    /// Returns false if shutdown was requested before or during the sleep.
    pub fn sleep(&self, dur: Duration) -> bool {
        let poll = Duration::from_millis(constants::SHUTDOWN_POLL_MS);
        let mut remaining = dur;
        while remaining > Duration::from_secs(0) {
            if self.is_requested() {
                return false;
            }
            let step = cmp::min(poll, remaining);
            thread::sleep(step);
            remaining -= step;
        }
        !self.is_requested()
    }
}

impl Default for Shutdown {
    fn default() -> Shutdown {
        Shutdown::new()
    }
}
