// ===============================
// src/recorder.rs
// ===============================
//
// Jurnal JSONL untuk event engine (sinyal, order, cancel, rekonsiliasi):
// - Append satu Event per baris, lewat BufWriter.
// - Flush tiap 1s atau tiap 100 event.
// - Parent directory dibuat otomatis.
// - Gagal tulis -> reopen sekali, kalau tetap gagal event dibuang (jurnal bukan state).
//
// ENV: `RECORD_FILE=/path/to/events.jsonl` (lihat main.rs).
//
use std::path::Path;
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info, warn};

use crate::domain::Event;

const FLUSH_EVERY_N_EVENTS: u32 = 100;

async fn open_writer(path: &str) -> std::io::Result<BufWriter<fs::File>> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(BufWriter::new(file))
}

fn encode(ev: &Event) -> Option<Vec<u8>> {
    match serde_json::to_vec(ev) {
        Ok(mut line) => {
            line.push(b'\n');
            Some(line)
        }
        Err(e) => {
            error!(?e, "recorder: serialize error, skip event");
            None
        }
    }
}

pub async fn run(mut rx: mpsc::Receiver<Event>, path: String) {
    let mut writer = match open_writer(&path).await {
        Ok(w) => w,
        Err(e) => {
            // Trading jalan terus tanpa jurnal; kosongkan channel supaya pengirim tidak macet
            error!(?e, %path, "recorder: open failed, journal disabled");
            while rx.recv().await.is_some() {}
            return;
        }
    };
    info!(%path, "recorder: started");

    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut since_last_flush: u32 = 0;

    loop {
        tokio::select! {
            maybe_ev = rx.recv() => {
                let Some(ev) = maybe_ev else {
                    let _ = writer.flush().await;
                    info!("recorder: channel closed, stopped");
                    break;
                };
                let Some(line) = encode(&ev) else { continue };

                if let Err(e) = writer.write_all(&line).await {
                    warn!(?e, "recorder: write failed, attempting reopen");
                    match open_writer(&path).await {
                        Ok(w) => {
                            writer = w;
                            if let Err(e2) = writer.write_all(&line).await {
                                error!(?e2, "recorder: write failed again after reopen, drop event");
                                continue;
                            }
                        }
                        Err(e2) => {
                            error!(?e2, "recorder: reopen failed, drop event");
                            continue;
                        }
                    }
                }

                since_last_flush += 1;
                if since_last_flush >= FLUSH_EVERY_N_EVENTS {
                    let _ = writer.flush().await;
                    since_last_flush = 0;
                }
            }

            _ = tick.tick() => {
                let _ = writer.flush().await;
                since_last_flush = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_one_event_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("events.jsonl");
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(run(rx, path.to_string_lossy().into_owned()));

        tx.send(Event::Note { msg: "hello".into() }).await.unwrap();
        tx.send(Event::OrderCanceled { txid: "T1".into(), pair: "ETH/BTC".into() }).await.unwrap();
        drop(tx);
        task.await.unwrap();

        let body = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "note");
        assert!(lines[1].contains("\"T1\""));
    }
}
