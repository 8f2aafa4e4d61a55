//! Routes decoded messages to the asset cacher.

use replaykit_codec::{AnnotatedMessage, Message};

use crate::cacher::AssetCacher;
use crate::sources::{JS_EXCEPTION_SOURCE, extract_js_exception_sources};

/// Per-message dispatch for the assets service.
///
/// Only page asset requests and script exceptions matter here; every
/// other message kind is meant for other consumers and is ignored.
#[derive(Debug)]
pub struct AssetHandler<C> {
    cacher: C,
}

impl<C: AssetCacher> AssetHandler<C> {
    pub fn new(cacher: C) -> Self {
        Self { cacher }
    }

    pub fn cacher(&self) -> &C {
        &self.cacher
    }

    pub fn cacher_mut(&mut self) -> &mut C {
        &mut self.cacher
    }

    pub fn into_cacher(self) -> C {
        self.cacher
    }

    pub fn handle(&mut self, session_id: u64, annotated: &AnnotatedMessage) {
        match &annotated.message {
            Message::AssetCache(asset) => {
                self.cacher.cache_url(session_id, &asset.url);
                metrics::counter!("assets_total").increment(1);
            }
            Message::ErrorEvent(event) if event.source == JS_EXCEPTION_SOURCE => {
                let sources = match extract_js_exception_sources(&event.payload) {
                    Ok(sources) => sources,
                    Err(err) => {
                        tracing::warn!(
                            session_id,
                            index = annotated.meta.index,
                            error = %err,
                            "Skipping exception with unreadable stack trace"
                        );
                        return;
                    }
                };
                for source in &sources {
                    self.cacher.cache_js_file(source);
                }
                metrics::counter!("js_sources_total").increment(sources.len() as u64);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cacher::CacheError;
    use crossbeam::channel::{self, Receiver};
    use replaykit_codec::{AssetCache, ConsoleLog, ErrorEvent, Meta};

    #[derive(Default)]
    struct Recorder {
        urls: Vec<(u64, String)>,
        js: Vec<String>,
    }

    impl AssetCacher for Recorder {
        fn cache_url(&mut self, session_id: u64, url: &str) {
            self.urls.push((session_id, url.to_string()));
        }

        fn cache_js_file(&mut self, source: &str) {
            self.js.push(source.to_string());
        }

        fn update_timeouts(&mut self) {}

        fn errors(&self) -> Receiver<CacheError> {
            channel::never()
        }
    }

    fn annotated(message: Message) -> AnnotatedMessage {
        AnnotatedMessage {
            meta: Meta::default(),
            message,
        }
    }

    fn error_event(source: &str, payload: &str) -> Message {
        Message::ErrorEvent(ErrorEvent {
            source: source.into(),
            payload: payload.into(),
            ..Default::default()
        })
    }

    #[test]
    fn asset_cache_goes_to_cache_url() {
        let mut handler = AssetHandler::new(Recorder::default());
        handler.handle(
            12,
            &annotated(Message::AssetCache(AssetCache {
                url: "https://a/b.css".into(),
            })),
        );
        assert_eq!(handler.cacher().urls, vec![(12, "https://a/b.css".to_string())]);
    }

    #[test]
    fn js_exception_caches_each_source() {
        let mut handler = AssetHandler::new(Recorder::default());
        let payload = r#"[{"fileName":"https://a/app.js"},{"fileName":"https://a/lib.js?x=1"}]"#;
        handler.handle(1, &annotated(error_event(JS_EXCEPTION_SOURCE, payload)));
        assert_eq!(
            handler.into_cacher().js,
            vec!["https://a/app.js".to_string(), "https://a/lib.js?x=1".to_string()]
        );
    }

    #[test]
    fn other_sources_and_kinds_are_ignored() {
        let mut handler = AssetHandler::new(Recorder::default());
        handler.handle(1, &annotated(error_event("backend", r#"[{"fileName":"https://a/x.js"}]"#)));
        handler.handle(
            1,
            &annotated(Message::ConsoleLog(ConsoleLog {
                level: "info".into(),
                value: "https://a/x.js".into(),
            })),
        );
        let cacher = handler.into_cacher();
        assert!(cacher.urls.is_empty());
        assert!(cacher.js.is_empty());
    }

    #[test]
    fn unreadable_stack_trace_is_skipped() {
        let mut handler = AssetHandler::new(Recorder::default());
        handler.handle(1, &annotated(error_event(JS_EXCEPTION_SOURCE, "{broken")));
        assert!(handler.cacher().js.is_empty());
    }
}
