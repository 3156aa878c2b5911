mod keyboards;
pub use keyboards::*;

use futures::{Future, TryStreamExt};
use teloxide::{net::Download, types::Message, Bot, DownloadError};

pub trait MessageStuff {
    /// Text of the message, or its caption if it has none.
    fn text_full(&self) -> Option<&str>;
}

impl MessageStuff for Message {
    fn text_full(&self) -> Option<&str> {
        self.text().or_else(|| self.caption())
    }
}

pub trait BotStuff {
    /// Download a file by its Telegram file path (as returned by `getFile`)
    /// and append its bytes to `to`.
    fn download_file_to_vec(
        &self,
        path: &str,
        to: &mut Vec<u8>,
    ) -> impl Future<Output = Result<(), DownloadError>> + Send;
}

impl BotStuff for Bot {
    async fn download_file_to_vec(&self, path: &str, to: &mut Vec<u8>) -> Result<(), DownloadError> {
        let mut stream = self.download_file_stream(path);

        while let Some(bytes) = stream.try_next().await? {
            to.extend_from_slice(&bytes);
        }

        Ok(())
    }
}
