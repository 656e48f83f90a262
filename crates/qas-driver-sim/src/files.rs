//! Synthetic pizza-box channel files.
//!
//! Rows are written in the text layout the hardware produces, using the
//! encoders in [`qas_core::codec`] so the handlers decode them bit-exactly.

use parking_lot::Mutex;
use qas_core::codec::{encode_adc_volts, encode_encoder_count, ENCODER_COUNT_MAX};
use qas_core::AppResult;
use qas_flyer::channel::ChannelKind;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

/// Writes `rows` synthetic rows per acquisition.
#[derive(Clone)]
pub struct ChannelFileWriter {
    kind: ChannelKind,
    rows: usize,
    analog_columns: usize,
    rng: Arc<Mutex<StdRng>>,
}

impl ChannelFileWriter {
    /// Writer for `kind`; `seed` makes the data reproducible.
    pub fn new(kind: ChannelKind, rows: usize, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            kind,
            rows,
            analog_columns: 1,
            rng: Arc::new(Mutex::new(rng)),
        }
    }

    /// Analog files holding `columns` ADC columns (2 for twin pairs).
    pub fn with_analog_columns(mut self, columns: usize) -> Self {
        self.analog_columns = columns.max(1);
        self
    }

    /// File contents for one acquisition.
    pub fn render(&self) -> String {
        let mut rng = self.rng.lock();
        let mut text = String::new();
        let mut count: i64 = -rng.gen_range(0..ENCODER_COUNT_MAX / 2);
        for i in 0..self.rows {
            let ts_s = 1_700_000_000 + (i / 1000) as i64;
            let ts_ns = ((i % 1000) * 1_000_000) as i64;
            match self.kind {
                ChannelKind::Encoder | ChannelKind::DigitalInput => {
                    count = (count - rng.gen_range(0..40)).max(-ENCODER_COUNT_MAX);
                    let raw = encode_encoder_count(count).unwrap_or(0);
                    let last = match self.kind {
                        ChannelKind::DigitalInput => i64::from(rng.gen_bool(0.5)),
                        _ => 0,
                    };
                    let _ = writeln!(text, "{ts_s} {ts_ns} {raw} {i} {last}");
                }
                ChannelKind::AnalogInput => {
                    let _ = write!(text, "{ts_s} {ts_ns} {i}");
                    for _ in 0..self.analog_columns {
                        let volts = rng.gen_range(-2.0..2.0);
                        let word = encode_adc_volts(volts).unwrap_or(0);
                        let _ = write!(text, " 0x{word:08x}");
                    }
                    text.push('\n');
                }
            }
        }
        text
    }

    /// Write one acquisition to `path`, creating parent directories.
    pub async fn write(&self, path: &Path) -> AppResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, self.render()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qas_core::handlers::{parse_analog_rows, parse_digital_rows, parse_encoder_rows};

    #[test]
    fn rendered_files_parse_back() {
        let enc = ChannelFileWriter::new(ChannelKind::Encoder, 50, Some(7)).render();
        let rows = parse_encoder_rows(&enc).unwrap();
        assert_eq!(rows.len(), 50);
        assert!(rows.iter().all(|r| r.encoder <= 0));
        assert!(rows.windows(2).all(|w| w[1].encoder <= w[0].encoder));

        let di = ChannelFileWriter::new(ChannelKind::DigitalInput, 20, Some(7)).render();
        assert!(parse_digital_rows(&di)
            .unwrap()
            .iter()
            .all(|r| r.di == 0 || r.di == 1));

        let an = ChannelFileWriter::new(ChannelKind::AnalogInput, 10, Some(7))
            .with_analog_columns(2)
            .render();
        let rows = parse_analog_rows(&an).unwrap();
        assert_eq!(rows[0].volts.len(), 2);
        assert!(rows.iter().flat_map(|r| &r.volts).all(|v| v.abs() < 2.001));
    }

    #[tokio::test]
    async fn write_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pb_data").join("en_abc123");
        ChannelFileWriter::new(ChannelKind::Encoder, 3, Some(1))
            .write(&path)
            .await
            .unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 3);
    }
}
