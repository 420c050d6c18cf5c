//! Wiring the predictive interposer into the proxy fabric.
//!
//! [`predictive_filter`] builds the channel filter installed by the
//! binary: session channels get an [`IoSwitch`] whose refractor, the
//! interposer, is bound lazily on the first `pty-req`, so file transfers
//! and tunnels stay raw. The accompanying request transformer watches the
//! session request stream for terminal geometry and consumes the
//! proxy-local configuration requests.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};

use crate::predictive::{
    EpochCallback, Interposer, InterposerOptions, IoSwitch, RingDelay, RING_CAPACITY,
};
use crate::proxy::requests::{PtyReqData, WindowChange};
use crate::proxy::{
    ChannelRequest, ChannelStreamFilter, FilterOutcome, RequestChannel, RequestTransformer,
};
use crate::stream::ByteStream;
use crate::term::DisplayPreference;

/// Request type consumed to change the prediction display preference.
pub const DISPLAY_PREFERENCE_REQUEST: &str = "foreshell/displayPreference";

/// Request type consumed to toggle overwrite prediction.
pub const PREDICT_OVERWRITE_REQUEST: &str = "foreshell/predictOverwrite";

/// Prefix of the per-epoch round-trip marker requests.
pub const PING_REQUEST_PREFIX: &str = "foreshell/ping/";

/// Behaviour knobs for [`predictive_filter`].
#[derive(Debug, Clone)]
pub struct FilterOptions {
    /// Enable the interposer at all. When false the filter only applies
    /// the artificial latency.
    pub predict: bool,

    /// Artificial write-side latency; zero disables the delay shim.
    pub fake_delay: Duration,

    /// Log per-epoch ping/pong timing at info level.
    pub print_timing: bool,

    /// Interposer tunables.
    pub interposer: InterposerOptions,
}

impl Default for FilterOptions {
    fn default() -> Self {
        Self {
            predict: true,
            fake_delay: Duration::ZERO,
            print_timing: false,
            interposer: InterposerOptions::default(),
        }
    }
}

/// Build the channel filter for the configured options.
pub fn predictive_filter(opts: FilterOptions) -> ChannelStreamFilter {
    Arc::new(move |channel_type: &str, server_channel: Arc<dyn RequestChannel>| {
        if channel_type != "session" {
            return FilterOutcome::default();
        }

        if !opts.predict {
            // no interposer, but the artificial latency still applies
            if opts.fake_delay > Duration::ZERO {
                let delayed: Arc<dyn ByteStream> = Arc::new(RingDelay::new(
                    server_channel.clone() as Arc<dyn ByteStream>,
                    opts.fake_delay,
                    RING_CAPACITY,
                ));
                return FilterOutcome {
                    stream: Some(delayed),
                    requests: None,
                };
            }
            return FilterOutcome::default();
        }

        let switch = Arc::new(IoSwitch::new(
            server_channel.clone() as Arc<dyn ByteStream>
        ));
        let transformer = session_request_transformer(
            opts.clone(),
            Arc::clone(&switch),
            server_channel,
        );
        FilterOutcome {
            stream: Some(switch as Arc<dyn ByteStream>),
            requests: Some(transformer),
        }
    })
}

/// The session request transformer: activates the interposer on the first
/// `pty-req`, tracks geometry, and consumes the proxy-local requests.
fn session_request_transformer(
    opts: FilterOptions,
    switch: Arc<IoSwitch>,
    server_channel: Arc<dyn RequestChannel>,
) -> RequestTransformer {
    Arc::new(move |mut incoming: mpsc::Receiver<ChannelRequest>| {
        let (outgoing_tx, outgoing_rx) = mpsc::channel(64);
        let opts = opts.clone();
        let switch = Arc::clone(&switch);
        let server_channel = Arc::clone(&server_channel);

        tokio::spawn(async move {
            let mut interposer: Option<Interposer> = None;

            while let Some(request) = incoming.recv().await {
                match request.kind.as_str() {
                    "pty-req" => {
                        if let Ok(pty) = PtyReqData::parse(&request.payload) {
                            let active = interposer.get_or_insert_with(|| {
                                activate_interposer(&opts, &switch, &server_channel)
                            });
                            active.resize(pty.width as u16, pty.height as u16).await;
                        }
                    }
                    "window-change" => {
                        if let (Ok(wc), Some(active)) =
                            (WindowChange::parse(&request.payload), interposer.as_ref())
                        {
                            active.resize(wc.width as u16, wc.height as u16).await;
                        }
                    }
                    DISPLAY_PREFERENCE_REQUEST => {
                        let recognised = match (
                            interposer.as_ref(),
                            parse_preference(&request.payload),
                        ) {
                            (Some(active), Some(preference)) => {
                                active.set_display_preference(preference).await;
                                true
                            }
                            _ => false,
                        };
                        if let Some(reply) = request.reply {
                            let _ = reply.send(recognised);
                        }
                        continue; // never forwarded
                    }
                    PREDICT_OVERWRITE_REQUEST => {
                        let recognised = match (
                            interposer.as_ref(),
                            parse_bool(&request.payload),
                        ) {
                            (Some(active), Some(overwrite)) => {
                                active.set_predict_overwrite(overwrite).await;
                                true
                            }
                            _ => false,
                        };
                        if let Some(reply) = request.reply {
                            let _ = reply.send(recognised);
                        }
                        continue; // never forwarded
                    }
                    _ => {}
                }
                if outgoing_tx.send(request).await.is_err() {
                    break;
                }
            }
        });

        outgoing_rx
    })
}

/// Instantiate the interposer behind the switch and start pinging.
fn activate_interposer(
    opts: &FilterOptions,
    switch: &Arc<IoSwitch>,
    server_channel: &Arc<dyn RequestChannel>,
) -> Interposer {
    let upstream: Arc<dyn ByteStream> = if opts.fake_delay > Duration::ZERO {
        Arc::new(RingDelay::new(
            server_channel.clone() as Arc<dyn ByteStream>,
            opts.fake_delay,
            RING_CAPACITY,
        ))
    } else {
        server_channel.clone() as Arc<dyn ByteStream>
    };

    let ping_channel = Arc::clone(server_channel);
    let fake_delay = opts.fake_delay;
    let print_timing = opts.print_timing;
    let callback: EpochCallback = Arc::new(move |interposer, epoch, opened_at| {
        let ping_channel = Arc::clone(&ping_channel);
        tokio::spawn(async move {
            if print_timing {
                info!("Ping {epoch}");
            }
            if fake_delay > Duration::ZERO {
                // the marker shares the simulated round trip
                tokio::time::sleep(fake_delay).await;
            }
            let (reply_tx, reply_rx) = oneshot::channel();
            ping_channel
                .send_channel_request(ChannelRequest {
                    kind: format!("{PING_REQUEST_PREFIX}{epoch}"),
                    want_reply: true,
                    payload: Vec::new(),
                    reply: Some(reply_tx),
                })
                .await;
            // success and failure both count: arrival is the signal
            match reply_rx.await {
                Ok(_) => {
                    if print_timing {
                        info!("Pong {epoch} - ({:?})", opened_at.elapsed());
                    } else {
                        debug!("pong {epoch} after {:?}", opened_at.elapsed());
                    }
                }
                Err(_) => {
                    warn!("ping {epoch} lost (channel gone)");
                }
            }
            interposer.acknowledge_epoch(epoch, opened_at).await;
        });
    });

    debug!("interposer activated");
    let interposer = Interposer::new(upstream, callback, opts.interposer.clone());
    switch.enable(Arc::new(interposer.clone()) as Arc<dyn ByteStream>);
    interposer
}

fn parse_preference(payload: &[u8]) -> Option<DisplayPreference> {
    DisplayPreference::parse(std::str::from_utf8(payload).ok()?)
}

fn parse_bool(payload: &[u8]) -> Option<bool> {
    match std::str::from_utf8(payload).ok()?.to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}
