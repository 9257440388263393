use crate::config::PipelineConfig;
use crate::types::*;
use crossbeam_channel::Receiver;
use log::{error, info};
use serde_json::json;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Writes one session directory: `manifest.json` with the effective config,
/// `windows.jsonl` with one [`WindowReport`] per line, and `stats.json` on exit.
pub struct DataLogger {
    rx: Receiver<WindowReport>,
    session_dir: PathBuf,
}

impl DataLogger {
    pub fn new(rx: Receiver<WindowReport>, output_dir: &Path, config: &PipelineConfig) -> io::Result<Self> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let session_dir = output_dir.join(format!("session_{}", timestamp));
        fs::create_dir_all(&session_dir)?;

        let manifest = json!({
            "version": env!("CARGO_PKG_VERSION"),
            "system": "emg-control",
            "config": config,
        });
        let text = serde_json::to_string_pretty(&manifest).map_err(io::Error::other)?;
        fs::write(session_dir.join("manifest.json"), text)?;

        Ok(Self { rx, session_dir })
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    /// Run the logger until every worker hangs up. Blocks the calling thread.
    pub fn run(self) {
        info!("Data logger → {:?}", self.session_dir);

        let path = self.session_dir.join("windows.jsonl");
        let mut writer = match File::create(&path) {
            Ok(f) => BufWriter::new(f),
            Err(e) => {
                error!("Failed to create {:?}: {}", path, e);
                return;
            }
        };

        let mut count: u64 = 0;
        let mut per_action: BTreeMap<String, u64> = BTreeMap::new();

        for report in self.rx.iter() {
            match serde_json::to_string(&report) {
                Ok(line) => {
                    if let Err(e) = writeln!(writer, "{}", line) {
                        error!("Session log write failed, logging stops: {}", e);
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to serialize window report: {}", e);
                    continue;
                }
            }
            if report.forwarded {
                *per_action.entry(report.decided.to_string()).or_default() += 1;
            }
            count += 1;
            if count % 500 == 0 {
                let _ = writer.flush();
                info!("Logged {} windows", count);
            }
        }
        let _ = writer.flush();

        let stats = json!({
            "total_windows": count,
            "forwarded": per_action,
        });
        match serde_json::to_string_pretty(&stats) {
            Ok(text) => fs::write(self.session_dir.join("stats.json"), text)
                .unwrap_or_else(|e| error!("Failed to write stats: {}", e)),
            Err(e) => error!("Failed to serialize stats: {}", e),
        }

        info!("Session saved: {} windows → {:?}", count, self.session_dir);
    }
}
