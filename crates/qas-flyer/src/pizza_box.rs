//! Pizza-box aggregate.
//!
//! A pizza-box owns its encoder and digital-input channels and drives them
//! as one device: every capability call fans out to all children in a fixed
//! order (encoders first). `collect()` stops any child that is still
//! capturing before reading its datums.

use async_trait::async_trait;
use futures::future::{join_all, try_join_all};
use qas_core::capabilities::{Flyable, Stageable};
use qas_core::document::{merge_describe, AssetDoc, CollectPoint, DescribeCollect};
use qas_core::status::Status;
use qas_core::AppResult;
use std::sync::Arc;
use tracing::debug;

use crate::channel::Channel;

/// A pizza-box with its channels.
pub struct PizzaBox {
    name: String,
    encoders: Vec<Arc<Channel>>,
    digital_inputs: Vec<Arc<Channel>>,
}

impl PizzaBox {
    /// New box; children keep their own names.
    pub fn new(
        name: impl Into<String>,
        encoders: Vec<Arc<Channel>>,
        digital_inputs: Vec<Arc<Channel>>,
    ) -> Self {
        Self {
            name: name.into(),
            encoders,
            digital_inputs,
        }
    }

    /// All children, encoders first.
    pub fn channels(&self) -> impl Iterator<Item = &Arc<Channel>> {
        self.encoders.iter().chain(self.digital_inputs.iter())
    }
}

#[async_trait]
impl Stageable for PizzaBox {
    async fn stage(&self) -> AppResult<()> {
        for ch in self.channels() {
            ch.stage().await?;
        }
        Ok(())
    }

    async fn unstage(&self) -> AppResult<()> {
        let mut first_err = None;
        for ch in self.channels() {
            if let Err(err) = ch.unstage().await {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl Flyable for PizzaBox {
    fn name(&self) -> &str {
        &self.name
    }

    /// Kicks off every child once; returns the first child's status.
    async fn kickoff(&self) -> AppResult<Status> {
        let mut first = None;
        for ch in self.channels() {
            let status = ch.kickoff().await?;
            first.get_or_insert(status);
        }
        debug!(device = %self.name, "Kicked off");
        Ok(first.unwrap_or_else(|| Status::done(format!("{}_kickoff", self.name))))
    }

    async fn complete(&self) -> AppResult<Status> {
        let statuses = try_join_all(self.channels().map(|ch| ch.complete())).await?;
        Ok(Status::all(format!("{}_complete", self.name), statuses))
    }

    async fn describe_collect(&self) -> DescribeCollect {
        let mut describe = DescribeCollect::new();
        for child in join_all(self.channels().map(|ch| ch.describe_collect())).await {
            merge_describe(&mut describe, child);
        }
        describe
    }

    async fn collect(&self) -> AppResult<Vec<CollectPoint>> {
        for ch in self.channels() {
            if ch.ready_to_collect().await {
                ch.complete().await?;
            }
        }
        let mut points = Vec::new();
        for ch in self.channels() {
            points.extend(ch.collect().await?);
        }
        Ok(points)
    }

    async fn collect_asset_docs(&self) -> Vec<AssetDoc> {
        let mut docs = Vec::new();
        for ch in self.channels() {
            docs.extend(ch.collect_asset_docs().await);
        }
        docs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelConfig, ChannelKind, ChannelSignals};
    use qas_core::paths::ShortPath;
    use qas_core::signal::{LocalSignal, PvValue, Signal};

    fn channel(name: &str, kind: ChannelKind) -> (Arc<Channel>, Arc<LocalSignal>) {
        let ignore_sel = Arc::new(LocalSignal::new(format!("{name}:IgnoreSel"), 1));
        let ch = Channel::new(
            name,
            kind,
            ChannelSignals {
                filepath: Arc::new(LocalSignal::new(format!("{name}:FilePath"), "")),
                ignore_sel: ignore_sel.clone(),
            },
            Arc::new(ShortPath::new("/epics/pb_data", kind.file_prefix())),
            ChannelConfig::default(),
        );
        (Arc::new(ch), ignore_sel)
    }

    #[tokio::test]
    async fn kickoff_reaches_every_child_once() {
        let mut encoders = Vec::new();
        let mut gates = Vec::new();
        for i in 1..=4 {
            let (ch, gate) = channel(&format!("pb9_enc{i}"), ChannelKind::Encoder);
            encoders.push(ch);
            gates.push(gate);
        }
        let (di, di_gate) = channel("pb9_di", ChannelKind::DigitalInput);
        gates.push(di_gate);
        let pb = PizzaBox::new("pb9", encoders, vec![di]);

        pb.stage().await.unwrap();
        let mut monitors: Vec<_> = gates.iter().map(|g| g.monitor()).collect();
        let status = pb.kickoff().await.unwrap();
        assert!(status.success());
        for (gate, monitor) in gates.iter().zip(monitors.iter_mut()) {
            assert_eq!(gate.value(), PvValue::Int(0));
            assert!(monitor.next().await.is_some());
        }

        pb.complete().await.unwrap().wait().await.unwrap();
        assert_eq!(pb.collect().await.unwrap().len(), 5);
        assert!(pb.collect().await.unwrap().is_empty());
        let describe = pb.describe_collect().await;
        assert_eq!(describe.len(), 5);
        assert!(describe.contains_key("pb9_di"));
        assert_eq!(pb.collect_asset_docs().await.len(), 10);
        pb.unstage().await.unwrap();
    }

    #[tokio::test]
    async fn collect_stops_channels_still_capturing() {
        let (enc, gate) = channel("pb9_enc1", ChannelKind::Encoder);
        let pb = PizzaBox::new("pb9", vec![enc.clone()], Vec::new());
        pb.stage().await.unwrap();
        pb.kickoff().await.unwrap();
        assert_eq!(pb.collect().await.unwrap().len(), 1);
        assert_eq!(gate.value(), PvValue::Int(1));
        assert!(!enc.ready_to_collect().await);
    }
}
