use std::sync::Arc;

use crate::config::DownloadConfig;
use crate::dispatcher::CallbackDispatcher;
use crate::file::{DefaultFileStrategy, ProcessFileStrategy};
use crate::store::{BreakpointStore, MemoryStore};
use crate::strategy::{DefaultDownloadStrategy, DownloadStrategy, LenienceRule, ReachedBlockEnd};

/// Collaborators shared by every task of a downloader. Built once and handed
/// around as an `Arc`.
pub struct DownloadContext {
    pub config: DownloadConfig,
    pub store: Arc<dyn BreakpointStore>,
    pub strategy: Arc<dyn DownloadStrategy>,
    pub lenience: Arc<dyn LenienceRule>,
    pub file_strategy: Arc<dyn ProcessFileStrategy>,
    pub dispatcher: CallbackDispatcher,
}

impl DownloadContext {
    pub fn builder(config: DownloadConfig) -> DownloadContextBuilder {
        DownloadContextBuilder {
            config,
            store: None,
            strategy: None,
            lenience: None,
            file_strategy: None,
            dispatcher: CallbackDispatcher::new(),
        }
    }
}

pub struct DownloadContextBuilder {
    config: DownloadConfig,
    store: Option<Arc<dyn BreakpointStore>>,
    strategy: Option<Arc<dyn DownloadStrategy>>,
    lenience: Option<Arc<dyn LenienceRule>>,
    file_strategy: Option<Arc<dyn ProcessFileStrategy>>,
    dispatcher: CallbackDispatcher,
}

impl DownloadContextBuilder {
    pub fn store(mut self, store: Arc<dyn BreakpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn strategy(mut self, strategy: Arc<dyn DownloadStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn lenience(mut self, lenience: Arc<dyn LenienceRule>) -> Self {
        self.lenience = Some(lenience);
        self
    }

    pub fn file_strategy(mut self, file_strategy: Arc<dyn ProcessFileStrategy>) -> Self {
        self.file_strategy = Some(file_strategy);
        self
    }

    pub fn dispatcher(mut self, dispatcher: CallbackDispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn build(self) -> DownloadContext {
        let config = self.config;
        let strategy = self
            .strategy
            .unwrap_or_else(|| Arc::new(DefaultDownloadStrategy::new(&config)));
        let lenience = self.lenience.unwrap_or_else(|| {
            Arc::new(ReachedBlockEnd {
                slack: config.lenience_slack,
            })
        });

        DownloadContext {
            store: self.store.unwrap_or_else(|| Arc::new(MemoryStore::new())),
            strategy,
            lenience,
            file_strategy: self
                .file_strategy
                .unwrap_or_else(|| Arc::new(DefaultFileStrategy)),
            dispatcher: self.dispatcher,
            config,
        }
    }
}
