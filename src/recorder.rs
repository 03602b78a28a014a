// ===============================
// src/recorder.rs
// ===============================
//
// Jurnal JSONL untuk event keluar (trade, error, likuidasi):
// - Satu baris per event: {"ts": ..., "event": {...}} (append).
// - BufWriter + flush tiap 1s, tiap FLUSH_EVERY event, dan saat channel ditutup.
// - Parent directory dibuat otomatis.
// - Gagal tulis -> reopen sekali; kalau file tidak bisa dibuka, event dibuang
//   dengan log error (proses utama tetap jalan).
//
// ENV: set `RECORD_FILE=/path/to/events.jsonl` agar aktif (lihat main.rs).
//
use std::{io, path::Path};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info, warn};

use crate::domain::Event;

const FLUSH_EVERY: u32 = 32;

#[derive(Serialize)]
struct JournalLine<'a> {
    ts: DateTime<Utc>,
    event: &'a Event,
}

async fn open_writer(path: &str) -> io::Result<BufWriter<fs::File>> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(BufWriter::new(file))
}

async fn write_line(writer: &mut BufWriter<fs::File>, line: &[u8]) -> io::Result<()> {
    writer.write_all(line).await?;
    writer.write_all(b"\n").await
}

pub async fn run(mut rx: mpsc::Receiver<Event>, path: String) {
    let mut writer = match open_writer(&path).await {
        Ok(w) => Some(w),
        Err(e) => {
            error!(error = %e, %path, "recorder: open failed, events will not be journaled");
            None
        }
    };
    info!(%path, "recorder: started");

    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut since_flush: u32 = 0;

    loop {
        tokio::select! {
            maybe_ev = rx.recv() => {
                let Some(ev) = maybe_ev else {
                    if let Some(w) = writer.as_mut() {
                        let _ = w.flush().await;
                    }
                    info!("recorder: channel closed, stopped");
                    break;
                };
                let line = match serde_json::to_vec(&JournalLine { ts: Utc::now(), event: &ev }) {
                    Ok(l) => l,
                    Err(e) => {
                        error!(error = %e, "recorder: serialize error, skip event");
                        continue;
                    }
                };

                let written = match writer.as_mut() {
                    Some(w) => write_line(w, &line).await,
                    None => Err(io::Error::new(io::ErrorKind::NotFound, "journal not open")),
                };
                if let Err(e) = written {
                    warn!(error = %e, "recorder: write failed, reopening");
                    writer = open_writer(&path).await.ok();
                    let retry = match writer.as_mut() {
                        Some(w) => write_line(w, &line).await,
                        None => Err(io::Error::new(io::ErrorKind::NotFound, "journal not open")),
                    };
                    if let Err(e2) = retry {
                        error!(error = %e2, "recorder: write failed after reopen, drop event");
                        continue;
                    }
                }

                since_flush += 1;
                if since_flush >= FLUSH_EVERY {
                    if let Some(w) = writer.as_mut() {
                        let _ = w.flush().await;
                    }
                    since_flush = 0;
                }
            }

            _ = tick.tick() => {
                if since_flush > 0 {
                    if let Some(w) = writer.as_mut() {
                        let _ = w.flush().await;
                    }
                    since_flush = 0;
                }
            }
        }
    }
}
