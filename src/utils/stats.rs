/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use log::info;

#[derive(Clone, Copy, Debug)]
pub enum CounterType {
    Counted,
    Gauged,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CounterValue {
    Signed(i64),
    Unsigned(u64),
    Float(f64),
}

impl fmt::Display for CounterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CounterValue::Signed(v) => write!(f, "{}", v),
            CounterValue::Unsigned(v) => write!(f, "{}", v),
            CounterValue::Float(v) => write!(f, "{}", v),
        }
    }
}

pub type Counter = (&'static str, CounterType, CounterValue);

pub trait RefCountable: Send + Sync {
    fn get_counters(&self) -> Vec<Counter>;
}

pub trait OwnedCountable: Send + Sync {
    fn get_counters(&self) -> Vec<Counter>;
    fn closed(&self) -> bool;
}

// Registering a clone of the Arc keeps a counter readable for the final
// summary even after its component has shut down.
impl<C: RefCountable> OwnedCountable for Arc<C> {
    fn get_counters(&self) -> Vec<Counter> {
        self.as_ref().get_counters()
    }

    fn closed(&self) -> bool {
        false
    }
}

pub enum Countable {
    Owned(Box<dyn OwnedCountable>),
    Ref(Weak<dyn RefCountable>),
}

impl Countable {
    pub fn get_counters(&self) -> Vec<Counter> {
        match self {
            Countable::Owned(c) => c.get_counters(),
            Countable::Ref(c) => c.upgrade().map(|c| c.get_counters()).unwrap_or_default(),
        }
    }

    pub fn closed(&self) -> bool {
        match self {
            Countable::Owned(c) => c.closed(),
            Countable::Ref(c) => c.strong_count() == 0,
        }
    }
}

struct Source {
    module: &'static str,
    tags: Vec<(&'static str, String)>,
    countable: Countable,
}

// An offline run has no statsd remote. Countables register here and the
// collector dumps everything to the log when the pipeline summarizes.
pub struct Collector {
    sources: Mutex<Vec<Source>>,
}

impl Collector {
    pub fn new() -> Self {
        Self {
            sources: Mutex::new(vec![]),
        }
    }

    pub fn register_countable(
        &self,
        module: &'static str,
        countable: Countable,
        tags: Vec<(&'static str, String)>,
    ) {
        self.sources.lock().unwrap().push(Source {
            module,
            tags,
            countable,
        });
    }

    pub fn log_counters(&self) {
        for source in self.sources.lock().unwrap().iter() {
            let counters = source.countable.get_counters();
            if counters.is_empty() {
                continue;
            }
            let fields = counters
                .iter()
                .map(|(name, _, value)| format!("{}={}", name, value))
                .collect::<Vec<_>>()
                .join(" ");
            if source.tags.is_empty() {
                info!("{}: {}", source.module, fields);
            } else {
                let tags = source
                    .tags
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect::<Vec<_>>()
                    .join(",");
                info!("{}[{}]: {}", source.module, tags, fields);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use super::*;

    struct DummyCounter(AtomicU64);

    impl RefCountable for DummyCounter {
        fn get_counters(&self) -> Vec<Counter> {
            vec![(
                "count",
                CounterType::Counted,
                CounterValue::Unsigned(self.0.swap(0, Ordering::Relaxed)),
            )]
        }
    }

    #[test]
    fn ref_countable_drops() {
        let counter = Arc::new(DummyCounter(AtomicU64::new(42)));
        let countable = Countable::Ref(Arc::downgrade(&counter) as Weak<dyn RefCountable>);
        assert_eq!(
            countable.get_counters()[0].2,
            CounterValue::Unsigned(42)
        );
        assert!(!countable.closed());
        drop(counter);
        assert!(countable.closed());
        assert!(countable.get_counters().is_empty());
    }
}
