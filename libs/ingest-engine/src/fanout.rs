use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use ingest_api::{Destination, ErrorKind, MetricFamily, Object, ObjectInfo, PluginError, Reference};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

/// Composite destination replicating one object to N underlying
/// destinations, skipping any that already have it (`spec.md` §4.6).
///
/// `store` buffers the object's bytes fully in memory once, so each
/// destination lacking the object can be replayed a fresh reader over
/// the same buffer — the single-pass source stream can otherwise only
/// be consumed once.
pub struct FanOut {
    destinations: Vec<Arc<dyn Destination>>,
}

impl FanOut {
    pub fn new(destinations: Vec<Arc<dyn Destination>>) -> Self {
        Self { destinations }
    }
}

#[async_trait]
impl Destination for FanOut {
    async fn stat(&self, reference: &Reference, cancel: &CancellationToken) -> Result<ObjectInfo, PluginError> {
        if self.destinations.is_empty() {
            return Err(PluginError::not_exist());
        }

        let results = join_all(self.destinations.iter().map(|d| d.stat(reference, cancel))).await;

        let mut first_info: Option<ObjectInfo> = None;
        let mut errors = Vec::new();
        for result in results {
            match result {
                Ok(info) => {
                    if first_info.is_none() {
                        first_info = Some(info);
                    }
                }
                Err(e) if e.is_not_exist() => return Err(PluginError::not_exist()),
                Err(e) => errors.push(e.to_string()),
            }
        }

        if !errors.is_empty() {
            return Err(PluginError::new(ErrorKind::Io, errors.join("; ")));
        }
        first_info.ok_or_else(PluginError::not_exist)
    }

    async fn store(&self, reference: &Reference, mut object: Object, cancel: &CancellationToken) -> Result<String, PluginError> {
        if self.destinations.is_empty() {
            return Err(PluginError::new(ErrorKind::Logic, "fan-out has no destinations configured"));
        }

        let mut buf = Vec::with_capacity(object.length as usize);
        object.stream.read_to_end(&mut buf).await?;
        let buf = Arc::new(buf);
        let mime_type = object.mime_type.clone();
        let length = object.length;

        let stores = self.destinations.iter().map(|dest| {
            let buf = buf.clone();
            let mime_type = mime_type.clone();
            async move {
                match dest.stat(reference, cancel).await {
                    Ok(info) => Ok(info.uri),
                    Err(e) if e.is_not_exist() => {
                        let reader: std::pin::Pin<Box<dyn tokio::io::AsyncRead + Send>> =
                            Box::pin(std::io::Cursor::new((*buf).clone()));
                        let fresh = Object::new(mime_type, length, reader);
                        dest.store(reference, fresh, cancel).await
                    }
                    Err(e) => Err(e),
                }
            }
        });

        let results = join_all(stores).await;
        let mut first_url: Option<String> = None;
        let mut errors = Vec::new();
        for result in results {
            match result {
                Ok(url) => {
                    if first_url.is_none() {
                        first_url = Some(url);
                    }
                }
                Err(e) => errors.push(e.to_string()),
            }
        }

        if !errors.is_empty() {
            return Err(PluginError::new(ErrorKind::Io, errors.join("; ")));
        }
        first_url.ok_or_else(|| PluginError::new(ErrorKind::Logic, "fan-out store produced no URL"))
    }

    async fn gather(&self) -> Result<Vec<MetricFamily>, PluginError> {
        let results = join_all(self.destinations.iter().map(|d| d.gather())).await;
        let mut out = Vec::new();
        for r in results {
            out.extend(r?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeDestination {
        name: &'static str,
        existing: Mutex<std::collections::HashSet<String>>,
        store_calls: Mutex<Vec<String>>,
    }

    impl FakeDestination {
        fn new(name: &'static str, pre_existing: &[&str]) -> Self {
            Self {
                name,
                existing: Mutex::new(pre_existing.iter().map(|s| s.to_string()).collect()),
                store_calls: Mutex::new(Vec::new()),
            }
        }

        fn store_count(&self) -> usize {
            self.store_calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Destination for FakeDestination {
        async fn stat(&self, reference: &Reference, _cancel: &CancellationToken) -> Result<ObjectInfo, PluginError> {
            if self.existing.lock().unwrap().contains(&reference.id) {
                Ok(ObjectInfo::new(format!("fake://{}/{}", self.name, reference.id)))
            } else {
                Err(PluginError::not_exist())
            }
        }

        async fn store(&self, reference: &Reference, mut object: Object, _cancel: &CancellationToken) -> Result<String, PluginError> {
            let mut buf = Vec::new();
            object.stream.read_to_end(&mut buf).await?;
            self.existing.lock().unwrap().insert(reference.id.clone());
            self.store_calls.lock().unwrap().push(reference.id.clone());
            Ok(format!("fake://{}/{}", self.name, reference.id))
        }
    }

    fn object_with(bytes: &'static [u8]) -> Object {
        let reader: std::pin::Pin<Box<dyn tokio::io::AsyncRead + Send>> = Box::pin(std::io::Cursor::new(bytes));
        Object::new("text/plain", bytes.len() as u64, reader)
    }

    #[tokio::test]
    async fn store_skips_destinations_that_already_have_it() {
        let d0 = Arc::new(FakeDestination::new("d0", &[]));
        let d1 = Arc::new(FakeDestination::new("d1", &["r1"]));
        let d2 = Arc::new(FakeDestination::new("d2", &["r1"]));
        let fanout = FanOut::new(vec![d0.clone(), d1.clone(), d2.clone()]);

        let reference = Reference::new("r1", "foo.bin");
        let url = fanout.store(&reference, object_with(b"hello"), &CancellationToken::new()).await.unwrap();

        assert_eq!(url, "fake://d0/r1");
        assert_eq!(d0.store_count(), 1);
        assert_eq!(d1.store_count(), 0);
        assert_eq!(d2.store_count(), 0);
    }

    #[tokio::test]
    async fn stat_reports_not_exist_if_any_destination_lacks_it() {
        let d0 = Arc::new(FakeDestination::new("d0", &["r1"]));
        let d1 = Arc::new(FakeDestination::new("d1", &[]));
        let fanout = FanOut::new(vec![d0, d1]);

        let err = fanout.stat(&Reference::new("r1", "foo.bin"), &CancellationToken::new()).await.unwrap_err();
        assert!(err.is_not_exist());
    }

    #[tokio::test]
    async fn stat_succeeds_and_store_is_noop_when_all_destinations_have_it() {
        let d0 = Arc::new(FakeDestination::new("d0", &["r1"]));
        let d1 = Arc::new(FakeDestination::new("d1", &["r1"]));
        let fanout = FanOut::new(vec![d0.clone(), d1.clone()]);

        let info = fanout.stat(&Reference::new("r1", "foo.bin"), &CancellationToken::new()).await.unwrap();
        assert_eq!(info.uri, "fake://d0/r1");

        let url = fanout.store(&Reference::new("r1", "foo.bin"), object_with(b"hello"), &CancellationToken::new()).await.unwrap();
        assert_eq!(url, "fake://d0/r1");
        assert_eq!(d0.store_count(), 0);
        assert_eq!(d1.store_count(), 0);
    }

    #[tokio::test]
    async fn fan_out_completeness_after_store() {
        let d0 = Arc::new(FakeDestination::new("d0", &[]));
        let fanout = FanOut::new(vec![d0]);

        let reference = Reference::new("r1", "foo.bin");
        fanout.store(&reference, object_with(b"hello"), &CancellationToken::new()).await.unwrap();
        assert!(fanout.stat(&reference, &CancellationToken::new()).await.is_ok());
    }

    #[tokio::test]
    async fn empty_fanout_reports_not_exist() {
        let fanout = FanOut::new(vec![]);
        let err = fanout.stat(&Reference::new("r1", "foo.bin"), &CancellationToken::new()).await.unwrap_err();
        assert!(err.is_not_exist());
    }
}
