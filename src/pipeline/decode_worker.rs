//! Decoding context: a dedicated thread owning decoders and byte buffers.
//!
//! Decoder instances and their accumulating data buffers never leave this
//! worker; the orchestrator talks to it exclusively by message, keyed by
//! session ID. The worker runs on a long-lived blocking thread so CPU-bound
//! decodes stay off the async workers, and exits when the orchestrator drops
//! its sender.
//!
//! Byte buffers are created on the first append even before a decoder is
//! selected: format sniffing may need more than one chunk, and the final
//! decode requires every byte received.

use crate::decode::ImageDecoder;
use crate::image::ImageContainer;
use crate::pipeline::orchestrator::PipelineMsg;
use crate::pipeline::session::SessionId;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use tokio::sync::mpsc;

pub(crate) enum DecodeMsg {
    /// Attaches the selected decoder to a session's decoding state.
    Start {
        session: SessionId,
        decoder: Box<dyn ImageDecoder>,
        progressive: bool,
    },
    /// Appends newly received bytes; optionally attempts a partial decode.
    Append {
        session: SessionId,
        data: Bytes,
        attempt_partial: bool,
    },
    /// Runs the final decode and drops the session's decoding state.
    Finish { session: SessionId },
    /// Drops the session's decoding state without decoding.
    Discard { session: SessionId },
}

struct DecodeState {
    decoder: Option<Box<dyn ImageDecoder>>,
    buffer: BytesMut,
    /// Buffer mark: partial decodes are attempted only on progressive
    /// sessions.
    progressive: bool,
}

impl DecodeState {
    fn new() -> Self {
        Self {
            decoder: None,
            buffer: BytesMut::new(),
            progressive: false,
        }
    }
}

/// Spawns the decoding worker and returns its submission handle.
pub(crate) fn spawn(results: mpsc::UnboundedSender<PipelineMsg>) -> mpsc::UnboundedSender<DecodeMsg> {
    let (tx, mut rx) = mpsc::unbounded_channel::<DecodeMsg>();
    tokio::task::spawn_blocking(move || {
        let mut states: HashMap<SessionId, DecodeState> = HashMap::new();
        while let Some(msg) = rx.blocking_recv() {
            match msg {
                DecodeMsg::Start {
                    session,
                    decoder,
                    progressive,
                } => {
                    let state = states.entry(session).or_insert_with(DecodeState::new);
                    state.decoder = Some(decoder);
                    state.progressive = progressive;
                }
                DecodeMsg::Append {
                    session,
                    data,
                    attempt_partial,
                } => {
                    let state = states.entry(session).or_insert_with(DecodeState::new);
                    state.buffer.extend_from_slice(&data);
                    if attempt_partial && state.progressive {
                        if let Some(decoder) = state.decoder.as_mut() {
                            if let Some(bitmap) = decoder.decode(&state.buffer, false) {
                                let scan_number = decoder.scan_number();
                                let _ = results.send(PipelineMsg::PartialDecoded {
                                    session,
                                    image: ImageContainer::preview(bitmap, scan_number),
                                });
                            }
                        }
                    }
                }
                DecodeMsg::Finish { session } => {
                    let image = states.remove(&session).and_then(|mut state| {
                        state
                            .decoder
                            .as_mut()
                            .and_then(|decoder| decoder.decode(&state.buffer, true))
                            .map(ImageContainer::new)
                    });
                    let _ = results.send(PipelineMsg::FinalDecoded { session, image });
                }
                DecodeMsg::Discard { session } => {
                    states.remove(&session);
                }
            }
        }
    });
    tx
}
