use skyway_media::PeerConnector;
use skyway_shared::error::MediaAccessError;
use skyway_shared::types::LocalStream;
use tracing::warn;

use crate::bridge::Bridge;

impl<C: PeerConnector> Bridge<C> {
    /// Register a captured stream. It is attached to every connection opened
    /// from now on. A stream without tracks counts as unavailable media.
    pub(crate) fn add_local_stream(&mut self, stream: LocalStream) {
        if stream.tracks.is_empty() {
            warn!(stream = %stream.id, "Local stream has no tracks");
            self.machine
                .media_access_failed(MediaAccessError::Unavailable("stream has no tracks".into()));
            return;
        }
        self.machine.add_local_stream(stream);
    }

    pub(crate) fn media_access_failed(&mut self, error: MediaAccessError) {
        self.machine.media_access_failed(error);
    }
}
