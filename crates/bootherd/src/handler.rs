//! Glue between the TFTP endpoint and the menu engine.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{info, warn};

use menu::MenuEngine;
use pxe::{classify, ClassifyError, OWN_CLASS_ID, OWN_CLASS_INFO};
use tftp::{ReadError, ReadHandler, TransferError, TransferObserver};

/// Serves the boot menu to clients whose path proves they run our own
/// chainloaded iPXE; everyone else is turned away so their firmware moves on
/// to the next boot stage.
pub struct IpxeBootHandler {
    engine: Arc<MenuEngine>,
}

impl IpxeBootHandler {
    pub fn new(engine: Arc<MenuEngine>) -> Self {
        IpxeBootHandler { engine }
    }
}

#[async_trait::async_trait]
impl ReadHandler for IpxeBootHandler {
    async fn open(&self, path: &str) -> Result<Bytes, ReadError> {
        let (mac, class_id, class_info) = classify(path).map_err(|err| match err {
            ClassifyError::Malformed(_) | ClassifyError::BadMac(_) => {
                ReadError::UnknownPath(path.to_string())
            }
        })?;

        if class_id != OWN_CLASS_ID || class_info != OWN_CLASS_INFO {
            return Err(ReadError::UnknownClass(format!("{class_id}:{class_info}")));
        }

        info!(%mac, "serving boot menu");
        let script = self
            .engine
            .render()
            .map_err(|err| ReadError::Failed(path.to_string(), err.into()))?;
        Ok(Bytes::from(script))
    }
}

/// Logs transfer outcomes; the machine's boot progress is otherwise
/// invisible from the server side.
pub struct LogObserver;

impl TransferObserver for LogObserver {
    fn on_success(&self, path: &str, peer: SocketAddr) {
        info!(%peer, %path, "boot file delivered");
    }

    fn on_failure(&self, path: &str, peer: SocketAddr, error: &TransferError) {
        warn!(%peer, %path, %error, "boot file delivery failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn handler() -> IpxeBootHandler {
        let engine = Arc::new(MenuEngine::new(Ipv4Addr::new(10, 0, 0, 1), 8080).unwrap());
        IpxeBootHandler::new(engine)
    }

    #[tokio::test]
    async fn recognized_class_gets_menu() {
        let path = format!("00:11:22:33:44:55/{OWN_CLASS_ID}/{OWN_CLASS_INFO}");
        let body = handler().open(&path).await.unwrap();
        let script = std::str::from_utf8(&body).unwrap();
        assert!(script.starts_with("#!ipxe"));
        assert!(script.contains("http://10.0.0.1:8080/ipxe"));
    }

    #[tokio::test]
    async fn unrecognized_class_is_rejected() {
        let path = "00:11:22:33:44:55/PXEClient:Arch:00007:UNDI:003016/[]";
        let err = handler().open(path).await.unwrap_err();
        assert!(matches!(err, ReadError::UnknownClass(_)));
    }

    #[tokio::test]
    async fn empty_class_pair_is_unknown_class_not_unknown_path() {
        let err = handler().open("00:11:22:33:44:55//").await.unwrap_err();
        assert!(matches!(err, ReadError::UnknownClass(_)));
    }

    #[tokio::test]
    async fn malformed_path_is_unknown() {
        let err = handler().open("not-a-boot-path").await.unwrap_err();
        assert!(matches!(err, ReadError::UnknownPath(_)));
        let err = handler().open("zz:zz/x/y").await.unwrap_err();
        assert!(matches!(err, ReadError::UnknownPath(_)));
    }
}
