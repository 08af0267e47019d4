use crate::error::{CvaeError, Result};
use indexmap::IndexMap;
use std::io;
use std::path::Path;

/// Metric values reported at the end of an epoch.
pub type Logs = IndexMap<String, f64>;

/// Mutable training state visible to callbacks.
#[derive(Clone, Debug, PartialEq)]
pub struct TrainingContext {
    pub learning_rate: f64,
    pub stop_training: bool,
}

impl TrainingContext {
    pub fn new(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            stop_training: false,
        }
    }
}

/// Hooks invoked by the epoch loop, in registration order.
pub trait Callback: Send {
    fn on_train_begin(&mut self, _ctx: &mut TrainingContext) {}

    fn on_epoch_end(&mut self, epoch: usize, logs: &Logs, ctx: &mut TrainingContext);

    fn on_train_end(&mut self, _ctx: &mut TrainingContext) {}
}

/// Halve-style learning-rate decay when a monitored value stops improving.
#[derive(Clone, Debug)]
pub struct ReduceLrOnPlateau {
    monitor: String,
    factor: f64,
    min_delta: f64,
    patience: usize,
    min_lr: f64,
    best: f64,
    wait: usize,
}

impl ReduceLrOnPlateau {
    pub fn new(
        monitor: impl Into<String>,
        factor: f64,
        min_delta: f64,
        patience: usize,
        min_lr: f64,
    ) -> Self {
        Self {
            monitor: monitor.into(),
            factor,
            min_delta,
            patience,
            min_lr,
            best: f64::INFINITY,
            wait: 0,
        }
    }
}

impl Callback for ReduceLrOnPlateau {
    fn on_train_begin(&mut self, _ctx: &mut TrainingContext) {
        self.best = f64::INFINITY;
        self.wait = 0;
    }

    fn on_epoch_end(&mut self, epoch: usize, logs: &Logs, ctx: &mut TrainingContext) {
        let current = match logs.get(&self.monitor) {
            Some(value) => *value,
            None => {
                log::warn!("learning rate reduction monitors `{}`, which is not logged", self.monitor);
                return;
            }
        };

        if current < self.best - self.min_delta {
            self.best = current;
            self.wait = 0;
            return;
        }

        self.wait += 1;
        if self.wait >= self.patience && ctx.learning_rate > self.min_lr {
            let lr = (ctx.learning_rate * self.factor).max(self.min_lr);
            log::info!(
                "epoch {}: reducing learning rate from {:.3e} to {:.3e}",
                epoch + 1,
                ctx.learning_rate,
                lr
            );
            ctx.learning_rate = lr;
            self.wait = 0;
        }
    }
}

/// Collects per-epoch logs in memory and writes them as CSV on request.
#[derive(Clone, Debug, Default)]
pub struct VirtualCsvLogger {
    epochs: Vec<(usize, Logs)>,
}

impl VirtualCsvLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    /// Logs of every recorded epoch, oldest first.
    pub fn history(&self) -> &[(usize, Logs)] {
        &self.epochs
    }

    /// Values of `name` across epochs.
    pub fn series(&self, name: &str) -> Vec<f64> {
        self.epochs
            .iter()
            .filter_map(|(_, logs)| logs.get(name).copied())
            .collect()
    }

    pub fn clear(&mut self) {
        self.epochs.clear();
    }

    /// `epoch` column followed by every logged key in sorted order.
    pub fn to_csv(&self) -> Result<String> {
        let mut writer = csv_writer().from_writer(Vec::new());
        self.write_records(&mut writer)?;
        let bytes = writer.into_inner().map_err(|err| err.into_error())?;
        String::from_utf8(bytes)
            .map_err(|err| CvaeError::Io(io::Error::new(io::ErrorKind::InvalidData, err)))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut writer = csv_writer().from_path(path)?;
        self.write_records(&mut writer)?;
        writer.flush()?;
        Ok(())
    }

    fn write_records<W: io::Write>(&self, writer: &mut csv::Writer<W>) -> Result<()> {
        let mut keys: Vec<&str> = self
            .epochs
            .iter()
            .flat_map(|(_, logs)| logs.keys().map(String::as_str))
            .collect();
        keys.sort_unstable();
        keys.dedup();

        writer.write_record(std::iter::once("epoch").chain(keys.iter().copied()))?;
        for (epoch, logs) in &self.epochs {
            let values = keys
                .iter()
                .map(|key| logs.get(*key).map(f64::to_string).unwrap_or_default());
            writer.write_record(std::iter::once(epoch.to_string()).chain(values))?;
        }
        Ok(())
    }
}

fn csv_writer() -> csv::WriterBuilder {
    let mut builder = csv::WriterBuilder::new();
    builder.terminator(csv::Terminator::Any(b'\n'));
    builder
}

impl Callback for VirtualCsvLogger {
    fn on_epoch_end(&mut self, epoch: usize, logs: &Logs, _ctx: &mut TrainingContext) {
        self.epochs.push((epoch, logs.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logs(loss: f64) -> Logs {
        let mut logs = Logs::new();
        logs.insert("loss".to_string(), loss);
        logs
    }

    #[test]
    fn plateau_halves_rate_after_patience() {
        let mut callback = ReduceLrOnPlateau::new("loss", 0.5, 0.01, 2, 1e-3);
        let mut ctx = TrainingContext::new(0.1);

        callback.on_epoch_end(0, &logs(1.0), &mut ctx);
        callback.on_epoch_end(1, &logs(0.995), &mut ctx);
        assert_eq!(ctx.learning_rate, 0.1);
        callback.on_epoch_end(2, &logs(0.999), &mut ctx);
        assert_eq!(ctx.learning_rate, 0.05);

        callback.on_epoch_end(3, &logs(0.5), &mut ctx);
        assert_eq!(ctx.learning_rate, 0.05);
    }

    #[test]
    fn plateau_respects_floor() {
        let mut callback = ReduceLrOnPlateau::new("loss", 0.5, 0.0, 1, 0.04);
        let mut ctx = TrainingContext::new(0.05);
        callback.on_epoch_end(0, &logs(1.0), &mut ctx);
        callback.on_epoch_end(1, &logs(1.0), &mut ctx);
        assert_eq!(ctx.learning_rate, 0.04);
        callback.on_epoch_end(2, &logs(1.0), &mut ctx);
        assert_eq!(ctx.learning_rate, 0.04);
    }

    #[test]
    fn plateau_ignores_missing_monitor() {
        let mut callback = ReduceLrOnPlateau::new("val_loss", 0.5, 0.0, 0, 0.0);
        let mut ctx = TrainingContext::new(0.1);
        callback.on_epoch_end(0, &logs(1.0), &mut ctx);
        assert_eq!(ctx.learning_rate, 0.1);
    }

    #[test]
    fn csv_has_sorted_header_and_one_row_per_epoch() {
        let mut logger = VirtualCsvLogger::new();
        let mut ctx = TrainingContext::new(0.1);
        let mut first = logs(2.0);
        first.insert("kl_loss".to_string(), 0.5);
        logger.on_epoch_end(0, &first, &mut ctx);
        logger.on_epoch_end(1, &logs(1.5), &mut ctx);

        assert_eq!(logger.to_csv().unwrap(), "epoch,kl_loss,loss\n0,0.5,2\n1,,1.5\n");
        assert_eq!(logger.series("loss"), vec![2.0, 1.5]);
    }

    #[test]
    fn save_writes_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut logger = VirtualCsvLogger::new();
        logger.on_epoch_end(0, &logs(1.0), &mut TrainingContext::new(0.1));

        let path = dir.path().join("log.csv");
        logger.save(&path)?;
        assert_eq!(std::fs::read_to_string(path)?, "epoch,loss\n0,1\n");
        Ok(())
    }

    #[test]
    fn save_reports_unwritable_path() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut logger = VirtualCsvLogger::new();
        logger.on_epoch_end(0, &logs(1.0), &mut TrainingContext::new(0.1));

        let err = logger.save(dir.path().join("missing").join("log.csv")).unwrap_err();
        assert!(matches!(err, CvaeError::Csv(_)));
        Ok(())
    }
}
