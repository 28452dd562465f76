use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use mss_demux::demux::{SeekRequest, SinkEvent, State};
use mss_demux::{Fetcher, HttpFetcher, MssDemux};
use mss_receiver::args::{get_log_level_filter, parse_args};
use mss_receiver::storage::FileHost;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, Layer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = parse_args();

    // Build the FmtSubscriber layer
    let fmt_layer = tracing_subscriber::fmt::layer()
        .pretty()
        .compact()
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_filter(get_log_level_filter(&args));

    #[cfg(feature = "console-tracing")]
    let subscriber = {
        let console_layer = console_subscriber::ConsoleLayer::builder()
            .retention(Duration::from_secs(60))
            .server_addr(([127, 0, 0, 1], 5555))
            .spawn();
        tracing_subscriber::registry()
            .with(console_layer)
            .with(fmt_layer)
    };

    #[cfg(not(feature = "console-tracing"))]
    let subscriber = {
        tracing_subscriber::registry()
            .with(fmt_layer)
    };

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting Smooth Streaming receiver");
    info!("{:?}", args);

    let config = args.demux_config()?;
    let fetcher = Arc::new(HttpFetcher::new());
    let manifest: Bytes = fetcher.fetch(&args.manifest_url).await?;
    info!("Fetched manifest ({} bytes)", manifest.len());

    let host = Arc::new(FileHost::new(&args.manifest_url, &args.output)?);
    let demux = MssDemux::new(host.clone(), fetcher, config);
    demux.set_state(State::Playing).await;

    if demux.chain(manifest).is_err() {
        error!("Demuxer refused the manifest");
        demux.set_state(State::Null).await;
        return Ok(());
    }
    if let Err(e) = demux.sink_event(SinkEvent::Eos).await {
        error!("{}: {}", e, e.debug_detail());
        demux.set_state(State::Null).await;
        return Err(e.into());
    }

    if let Some(start) = args.start {
        match Duration::try_from_secs_f64(start) {
            Ok(start) if demux.seek(SeekRequest::time(start)).await => info!("Seeked to {:?}", start),
            Ok(start) => warn!("Could not seek to {:?}", start),
            Err(e) => warn!("Ignoring start position {}: {}", start, e),
        }
    }

    tokio::select! {
        _ = host.wait_finished() => info!("All channels finished"),
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }
    demux.set_state(State::Null).await;

    for channel in host.summary() {
        info!(
            "{}: {} fragments, {} bytes{}",
            channel.id,
            channel.buffers,
            channel.bytes,
            if channel.failed { " (failed)" } else { "" }
        );
    }
    for message in host.errors() {
        warn!("Error during download: {}", message);
    }

    Ok(())
}
