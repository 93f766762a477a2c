mod file;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use streaming::{
    ClientCallback, ClientConfig, ClientEvent, Codec, Credentials, RtspClient, RtspError, Server,
    ServerConfig, ServerError, ServerEvent, ServerListener, Session, TransportMode, UriOptions,
};
use tracing_subscriber::EnvFilter;

use crate::file::{AacFile, H264File};

#[derive(Parser)]
#[command(
    name = "rtsp-streamer",
    about = "Stream H.264 and AAC files over RTP, as an RTSP server or by pushing to one"
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Clone)]
struct Media {
    /// H.264 Annex B elementary stream
    #[arg(long)]
    h264: Option<PathBuf>,
    /// MP4/3GP sample recording to read the H.264 SPS and PPS from
    #[arg(long, requires = "h264")]
    h264_config: Option<PathBuf>,
    /// AAC ADTS elementary stream
    #[arg(long)]
    aac: Option<PathBuf>,
    /// Video frame rate
    #[arg(long, default_value_t = 25)]
    fps: u32,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the files to RTSP players
    Serve {
        /// Bind address (host:port)
        #[arg(long, short, default_value = "0.0.0.0:8086")]
        bind: String,
        /// Require Basic auth with this user
        #[arg(long)]
        username: Option<String>,
        #[arg(long, default_value = "")]
        password: String,
        #[command(flatten)]
        media: Media,
    },
    /// Publish the files to a remote RTSP server
    Push {
        #[arg(long)]
        host: String,
        #[arg(long, default_value_t = 1935)]
        port: u16,
        /// Stream path on the server
        #[arg(long, default_value = "/live")]
        path: String,
        #[arg(long)]
        username: Option<String>,
        #[arg(long, default_value = "")]
        password: String,
        /// Interleave RTP on the RTSP connection instead of UDP
        #[arg(long)]
        tcp: bool,
        #[command(flatten)]
        media: Media,
    },
}

impl Media {
    /// A session with the tracks that have a file. URI options can drop a
    /// track but cannot add one without a file.
    fn session(&self, options: Option<&UriOptions>) -> streaming::Result<Session> {
        let defaults = options.is_none_or(UriOptions::wants_defaults);
        let want_video = defaults || options.is_some_and(|o| o.video.is_some());
        let want_audio = defaults || options.is_some_and(|o| o.audio.is_some());

        let mut builder = Session::builder();
        if let Some(path) = self.h264.clone().filter(|_| want_video) {
            let file = H264File::new(path, self.fps).with_recording(self.h264_config.clone());
            builder = builder.video(Codec::H264, Box::new(file));
        }
        if let Some(path) = self.aac.clone().filter(|_| want_audio) {
            builder = builder.audio(Codec::AacLatm, Box::new(AacFile::new(path)));
        }
        builder.build()
    }

    fn is_empty(&self) -> bool {
        self.h264.is_none() && self.aac.is_none()
    }
}

struct Report;

impl ServerListener for Report {
    fn on_event(&self, event: ServerEvent) {
        tracing::info!(?event, "server event");
    }

    fn on_error(&self, error: &ServerError) {
        tracing::error!(%error, "server error");
    }
}

impl ClientCallback for Report {
    fn on_rtsp_update(&self, event: ClientEvent) {
        match event {
            ClientEvent::ConnectionRecovered => tracing::info!("connection recovered"),
            other => tracing::warn!(event = ?other, "client event"),
        }
    }
}

fn wait_for_enter(what: &str) {
    println!("{what}, press Enter to stop");
    let mut input = String::new();
    if let Err(e) = io::stdin().read_line(&mut input) {
        tracing::warn!(error = %e, "cannot read stdin");
    }
}

fn serve(bind: String, credentials: Option<Credentials>, media: Media) -> streaming::Result<()> {
    let config = ServerConfig {
        bind_addr: bind,
        credentials,
        ..ServerConfig::default()
    };
    let factory = move |options: &UriOptions| media.session(Some(options));
    let mut server = Server::new(config, factory);
    server.add_listener(Arc::new(Report));
    server.start()?;

    wait_for_enter(&format!("RTSP server on {}", server.local_addr()?));
    server.stop();
    Ok(())
}

fn push(
    host: String,
    port: u16,
    path: String,
    credentials: Option<Credentials>,
    transport: TransportMode,
    media: Media,
) -> streaming::Result<()> {
    let client = RtspClient::new(ClientConfig::default())?;
    client.set_callback(Some(Arc::new(Report)));
    client.set_session(media.session(None)?);
    client.set_server_address(host.clone(), port);
    client.set_stream_path(path.clone());
    client.set_transport_mode(transport);
    if let Some(c) = credentials {
        client.set_credentials(c.username, c.password);
    }
    client.start_stream()?;

    wait_for_enter(&format!("Publishing to rtsp://{host}:{port}{path}"));
    client.release();
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let result = match args.command {
        Command::Serve {
            bind,
            username,
            password,
            media,
        } => {
            if media.is_empty() {
                Err(RtspError::InvalidState("nothing to serve: pass --h264 and/or --aac"))
            } else {
                serve(bind, username.map(|u| Credentials::new(u, password)), media)
            }
        }
        Command::Push {
            host,
            port,
            path,
            username,
            password,
            tcp,
            media,
        } => {
            let transport = if tcp { TransportMode::Tcp } else { TransportMode::Udp };
            if media.is_empty() {
                Err(RtspError::InvalidState("nothing to publish: pass --h264 and/or --aac"))
            } else {
                push(
                    host,
                    port,
                    path,
                    username.map(|u| Credentials::new(u, password)),
                    transport,
                    media,
                )
            }
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
