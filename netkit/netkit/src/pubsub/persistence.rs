// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Optional broker persistence.
//!
//! The broker is at-most-once and in-memory by contract; an adapter can
//! record published messages and replay them on demand. The default adapter
//! does nothing.

use super::{trie::pattern_matches, BrokerMessage};

pub trait PersistenceAdapter: Send + Sync + 'static {
    fn record(&self, message: &BrokerMessage);

    fn replay(&self, pattern: &str, since: u64) -> Box<dyn Iterator<Item = BrokerMessage> + Send>;
}

/// The default adapter: records nothing, replays nothing
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopPersistence;

impl PersistenceAdapter for NoopPersistence {
    fn record(&self, _message: &BrokerMessage) {}

    fn replay(&self, _pattern: &str, _since: u64) -> Box<dyn Iterator<Item = BrokerMessage> + Send> {
        Box::new(core::iter::empty())
    }
}

/// Append-only JSONL log adapter
#[cfg(feature = "persistence")]
pub use jsonl::JsonlLog;

#[cfg(feature = "persistence")]
mod jsonl {
    use super::*;
    use std::{
        fs::{File, OpenOptions},
        io::{BufRead, BufReader, Write},
        path::{Path, PathBuf},
        sync::Mutex,
    };
    use tracing::warn;

    #[derive(Debug)]
    pub struct JsonlLog {
        path: PathBuf,
        file: Mutex<File>,
    }

    impl JsonlLog {
        pub fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
            let path = path.into();
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            Ok(Self {
                path,
                file: Mutex::new(file),
            })
        }

        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    impl PersistenceAdapter for JsonlLog {
        fn record(&self, message: &BrokerMessage) {
            let line = match serde_json::to_string(message) {
                Ok(line) => line,
                Err(error) => {
                    warn!(%error, "failed to serialize broker message for the log");
                    return;
                }
            };

            let mut file = self.file.lock().expect("log lock");
            if let Err(error) = writeln!(file, "{line}") {
                warn!(%error, "failed to append to the broker log");
            }
        }

        fn replay(
            &self,
            pattern: &str,
            since: u64,
        ) -> Box<dyn Iterator<Item = BrokerMessage> + Send> {
            let pattern = pattern.to_owned();
            let Ok(file) = File::open(&self.path) else {
                return Box::new(core::iter::empty());
            };

            let iter = BufReader::new(file)
                .lines()
                .map_while(|line| line.ok())
                .filter_map(|line| serde_json::from_str::<BrokerMessage>(&line).ok())
                .filter(move |message| {
                    message.sequence >= since && pattern_matches(&pattern, &message.topic)
                });

            Box::new(iter)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use serde_json::json;

        #[test]
        fn record_and_replay_filters_by_pattern_and_sequence() {
            let dir = tempfile::tempdir().unwrap();
            let log = JsonlLog::open(dir.path().join("broker.jsonl")).unwrap();

            for (sequence, topic) in [(0, "news/sports"), (1, "news/politics"), (2, "weather/uk")]
            {
                log.record(&BrokerMessage {
                    topic: topic.into(),
                    message: json!("payload"),
                    metadata: None,
                    publisher: 9,
                    sequence,
                });
            }

            let replayed: Vec<_> = log.replay("news/*", 1).collect();
            assert_eq!(replayed.len(), 1);
            assert_eq!(replayed[0].topic, "news/politics");
        }
    }
}
