// Copyright © Palisade Contributors
// SPDX-License-Identifier: Apache-2.0

//! The cadaver: an append-only local trace of every event the player
//! consumed and every action it produced, kept for postmortems. The file
//! rotates to `.cdv.archive` once it passes the configured size target, so
//! at most two generations exist at a time.

use crate::actions::ActionType;
use palisade_agreement_types::{Period, Round, Step};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use tracing::warn;

#[derive(Debug, Serialize, Deserialize)]
pub struct CadaverEntry {
    pub round: Round,
    pub period: Period,
    pub step: Step,
    pub event: String,
    pub actions: Vec<ActionType>,
}

pub struct Cadaver {
    file: Option<File>,
    base: PathBuf,
    size_target: u64,
    written: u64,
}

impl Cadaver {
    /// A disabled cadaver writes nothing.
    pub fn disabled() -> Cadaver {
        Cadaver { file: None, base: PathBuf::new(), size_target: 0, written: 0 }
    }

    pub fn open(base: Option<PathBuf>, size_target: u64) -> Cadaver {
        let Some(base) = base else { return Cadaver::disabled() };
        if size_target == 0 {
            return Cadaver::disabled();
        }
        let file = match append_file(&trace_path(&base)) {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(path = %base.display(), error = %e, "could not open cadaver");
                None
            },
        };
        let written = file
            .as_ref()
            .and_then(|f| f.metadata().ok())
            .map(|m| m.len())
            .unwrap_or(0);
        Cadaver { file, base, size_target, written }
    }

    pub fn record(&mut self, entry: &CadaverEntry) {
        let Some(file) = self.file.as_mut() else { return };
        let Ok(frame) = bcs::to_bytes(entry) else { return };
        let len = (frame.len() as u32).to_le_bytes();
        if file.write_all(&len).and_then(|_| file.write_all(&frame)).is_err() {
            // Tracing is best effort; a broken trace must never stall the
            // protocol.
            self.file = None;
            return;
        }
        self.written += (frame.len() + len.len()) as u64;
        if self.written > self.size_target {
            self.rotate();
        }
    }

    fn rotate(&mut self) {
        self.file = None;
        self.written = 0;
        let trace = trace_path(&self.base);
        let archive = archive_path(&self.base);
        if let Err(e) = std::fs::rename(&trace, &archive) {
            warn!(error = %e, "could not archive cadaver");
        }
        match append_file(&trace) {
            Ok(file) => self.file = Some(file),
            Err(e) => warn!(error = %e, "could not reopen cadaver after rotation"),
        }
    }
}

fn trace_path(base: &PathBuf) -> PathBuf {
    let mut path = base.as_os_str().to_owned();
    path.push(".cdv");
    PathBuf::from(path)
}

fn archive_path(base: &PathBuf) -> PathBuf {
    let mut path = base.as_os_str().to_owned();
    path.push(".cdv.archive");
    PathBuf::from(path)
}

fn append_file(path: &PathBuf) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}
