use std::ffi::CString;

use ::pcsc::{Card, Context, Disposition, Protocols, Scope, ShareMode};
use tracing::{debug, info};

use crate::u2f::error::{Error, TransportError};
use crate::u2f::transport::RawTransport;

impl From<::pcsc::Error> for Error {
    fn from(e: ::pcsc::Error) -> Self {
        match e {
            ::pcsc::Error::Timeout => Error::Transport(TransportError::Timeout),
            e => Error::Transport(TransportError::Io(e.to_string())),
        }
    }
}

/// A contactless reader reached through PC/SC.
pub struct PcscReader {
    context: Context,
    reader: CString,
    card: Option<Card>,
}

impl PcscReader {
    pub fn list_readers() -> Result<Vec<String>, Error> {
        let context = Context::establish(Scope::User)?;
        Ok(context
            .list_readers_owned()?
            .into_iter()
            .map(|r| r.to_string_lossy().into_owned())
            .collect())
    }

    /// Opens `name`, or the first reader found when `name` is `None`.
    pub fn new(name: Option<&str>) -> Result<Self, Error> {
        let context = Context::establish(Scope::User)?;
        let readers = context.list_readers_owned()?;

        let reader = match name {
            Some(name) => readers
                .into_iter()
                .find(|r| r.to_bytes() == name.as_bytes())
                .ok_or_else(|| Error::Config(format!("smart card reader {} does not exist", name)))?,
            None => readers
                .into_iter()
                .next()
                .ok_or_else(|| Error::Config("no smart card reader found".to_string()))?,
        };

        info!("using reader {}", reader.to_string_lossy());

        Ok(PcscReader {
            context,
            reader,
            card: None,
        })
    }
}

impl RawTransport for PcscReader {
    fn connect(&mut self) -> Result<(), Error> {
        let card = self.context.connect(&self.reader, ShareMode::Shared, Protocols::ANY)?;
        self.card = Some(card);
        debug!("card connected");
        Ok(())
    }

    fn transmit(&mut self, capdu: &[u8], max_response: usize) -> Result<Vec<u8>, Error> {
        let card = self.card.as_ref().ok_or(TransportError::Closed)?;
        let mut buf = vec![0u8; max_response.max(2)];
        let rapdu = card.transmit(capdu, &mut buf)?;
        Ok(rapdu.to_vec())
    }

    fn disconnect(&mut self) {
        if let Some(card) = self.card.take() {
            if let Err((_, e)) = card.disconnect(Disposition::ResetCard) {
                debug!("card disconnect failed: {}", e);
            }
        }
    }
}
