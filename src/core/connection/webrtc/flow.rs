//! Send-side flow control for the data channel.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

use crate::core::config::{DC_BUFFERED_AMOUNT_HIGH, DC_DRAIN_POLL, DC_DRAIN_TIMEOUT};
use crate::core::error::TransferError;

/// Waits until `next_msg_size` more bytes fit under the high water mark.
pub(super) async fn wait_for_buffer_space(
    dc: &Arc<RTCDataChannel>,
    next_msg_size: usize,
) -> Result<(), TransferError> {
    ensure_open(dc)?;
    let buffered = dc.buffered_amount().await;
    if buffered + next_msg_size <= DC_BUFFERED_AMOUNT_HIGH {
        return Ok(());
    }

    info!(
        channel = %dc.label(),
        buffered,
        next_msg = next_msg_size,
        high_watermark = DC_BUFFERED_AMOUNT_HIGH,
        "Applying backpressure - waiting for buffer to drain"
    );

    let deadline = Instant::now() + DC_DRAIN_TIMEOUT;
    loop {
        ensure_open(dc)?;
        if dc.buffered_amount().await + next_msg_size <= DC_BUFFERED_AMOUNT_HIGH {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(TransferError::TransportLoss(format!(
                "send buffer on '{}' did not drain within {:?}",
                dc.label(),
                DC_DRAIN_TIMEOUT
            )));
        }
        tokio::time::sleep(DC_DRAIN_POLL).await;
    }
}

/// Best-effort wait for everything queued to leave before closing.
pub(super) async fn drain(dc: &Arc<RTCDataChannel>) {
    let deadline = Instant::now() + DC_DRAIN_TIMEOUT;
    while dc.ready_state() == RTCDataChannelState::Open && Instant::now() < deadline {
        let buffered = dc.buffered_amount().await;
        if buffered == 0 {
            return;
        }
        debug!(channel = %dc.label(), buffered, "Draining before close");
        tokio::time::sleep(DC_DRAIN_POLL).await;
    }
}

fn ensure_open(dc: &Arc<RTCDataChannel>) -> Result<(), TransferError> {
    match dc.ready_state() {
        RTCDataChannelState::Open => Ok(()),
        state => Err(TransferError::TransportLoss(format!(
            "data channel '{}' is {state:?}",
            dc.label()
        ))),
    }
}
