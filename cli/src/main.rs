use base64::{engine::general_purpose::STANDARD, Engine as _};
use clap::{Parser, Subcommand};
use hound::WavSpec;
use std::fs::File;
use std::path::PathBuf;
use tonelink_core::config::ConfigUpdate;
use tonelink_core::framing::{open_frame, FrameDecoder, FrameEncoder, FrameKind};
use tonelink_core::fsk::DemodEvent;
use tonelink_core::session::IDLE_GUARD_SYMBOLS;
use tonelink_core::{
    derive_public_key, Engine, EngineConfig, EngineState, FecCodec, FskModem, MAX_PAYLOAD_SIZE,
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Samples handed to the engines per loopback round
const LOOPBACK_CHUNK: usize = 1600;

#[derive(Parser)]
#[command(name = "tonelink")]
#[command(about = "Encrypted voice and data tunnel over an audio channel")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the public key for a 32-byte identity seed
    Pubkey {
        /// Seed, base64 encoded
        #[arg(long)]
        seed: String,
    },

    /// Encode a file into unencrypted FSK frames in a WAV file
    Encode {
        /// Input binary file
        #[arg(value_name = "INPUT.BIN")]
        input: PathBuf,

        /// Output WAV file
        #[arg(value_name = "OUTPUT.WAV")]
        output: PathBuf,

        /// Partial engine configuration as JSON, e.g. '{"fecEnabled": false}'
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Decode unencrypted FSK frames from a WAV file
    Decode {
        /// Input WAV file
        #[arg(value_name = "INPUT.WAV")]
        input: PathBuf,

        /// Output binary file
        #[arg(value_name = "OUTPUT.BIN")]
        output: PathBuf,

        /// Partial engine configuration as JSON; the sample rate comes from the WAV header
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Run a server and a client engine back to back and send a message
    Loopback {
        /// Message sent from client to server
        #[arg(short, long, default_value = "hello over the air")]
        message: String,

        /// Server identity seed, base64 encoded
        #[arg(long)]
        server_seed: Option<String>,

        /// Client identity seed, base64 encoded
        #[arg(long)]
        client_seed: Option<String>,

        /// Partial engine configuration as JSON, applied to both engines
        #[arg(short, long)]
        config: Option<String>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(Cli::parse()) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> CliResult<()> {
    match cli.command {
        Commands::Pubkey { seed } => pubkey_command(&seed)?,
        Commands::Encode { input, output, config } => encode_command(&input, &output, config.as_deref())?,
        Commands::Decode { input, output, config } => decode_command(&input, &output, config.as_deref())?,
        Commands::Loopback {
            message,
            server_seed,
            client_seed,
            config,
        } => loopback_command(
            &message,
            server_seed.as_deref(),
            client_seed.as_deref(),
            config.as_deref(),
        )?,
    }

    Ok(())
}

fn load_config(json: Option<&str>) -> CliResult<EngineConfig> {
    let config = EngineConfig::default();
    let Some(json) = json else {
        return Ok(config);
    };
    let update = ConfigUpdate::from_json(json)?;
    for key in update.unknown_keys() {
        warn!("ignoring unknown config key {:?}", key);
    }
    Ok(config.merged(&update)?)
}

fn decode_seed(seed: &str) -> CliResult<Vec<u8>> {
    Ok(STANDARD.decode(seed.trim())?)
}

fn pubkey_command(seed: &str) -> CliResult<()> {
    let public = derive_public_key(&decode_seed(seed)?)?;
    println!("{}", STANDARD.encode(public));
    Ok(())
}

fn encode_command(input_path: &PathBuf, output_path: &PathBuf, config: Option<&str>) -> CliResult<()> {
    let config = load_config(config)?;

    let data = std::fs::read(input_path)?;
    println!("Read {} bytes from {}", data.len(), input_path.display());

    let mut modem = FskModem::new(config.modem_config())?;
    let mut fec = FecCodec::new();
    let guard = vec![0i16; modem.samples_per_symbol() * IDLE_GUARD_SYMBOLS];
    let chunk_size = FrameEncoder::max_inner(config.fec_enabled);

    // Silence before the first frame lets the receiver settle
    let mut samples = guard.clone();
    let mut frames = 0usize;
    for chunk in data.chunks(chunk_size) {
        let bytes = FrameEncoder::build(FrameKind::Plain, chunk, config.fec_enabled.then_some(&mut fec))?;
        samples.extend(modem.modulate(&bytes));
        samples.extend_from_slice(&guard);
        frames += 1;
    }
    println!(
        "Encoded {} frames ({}) to {} audio samples",
        frames,
        if config.fec_enabled { "RS(255,223)" } else { "no FEC" },
        samples.len()
    );

    let spec = WavSpec {
        channels: 1,
        sample_rate: config.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let file = File::create(output_path)?;
    let mut writer = hound::WavWriter::new(file, spec)?;
    for sample in samples {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;

    println!("Wrote {}", output_path.display());
    Ok(())
}

fn decode_command(input_path: &PathBuf, output_path: &PathBuf, config: Option<&str>) -> CliResult<()> {
    let mut config = load_config(config)?;

    let file = File::open(input_path)?;
    let mut reader = hound::WavReader::new(file)?;
    let spec = reader.spec();
    println!(
        "Read WAV: {} Hz, {} channels, {} bits",
        spec.sample_rate, spec.channels, spec.bits_per_sample
    );

    // Extract samples (16-bit integer or 32-bit float)
    let interleaved: Vec<i16> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Int, 16) => reader.samples::<i16>().collect::<Result<_, _>>()?,
        (hound::SampleFormat::Float, 32) => reader
            .samples::<f32>()
            .map(|s| s.map(|v| (v.clamp(-1.0, 1.0) * i16::MAX as f32) as i16))
            .collect::<Result<_, _>>()?,
        (format, bits) => {
            return Err(format!("Unsupported WAV format: {:?} {} bits", format, bits).into());
        }
    };
    // First channel only
    let samples: Vec<i16> = interleaved
        .iter()
        .step_by(spec.channels.max(1) as usize)
        .copied()
        .collect();

    config.sample_rate = spec.sample_rate;
    config.validate()?;
    let mut modem = FskModem::new(config.modem_config())?;
    let mut fec = FecCodec::new();
    let mut deframer = FrameDecoder::new();

    let mut frames = Vec::new();
    let mut lost = 0usize;
    modem.demodulate_with(&samples, |event| match event {
        DemodEvent::Byte(byte) => match deframer.push(byte) {
            Some(Ok(frame)) => frames.push(frame),
            Some(Err(e)) => {
                debug!("dropping frame: {}", e);
                lost += 1;
            }
            None => {}
        },
        DemodEvent::LockLost => {
            if deframer.reset() {
                lost += 1;
            }
        }
    });

    let mut data = Vec::new();
    let mut corrected = 0usize;
    for mut frame in frames {
        if frame.kind != FrameKind::Plain {
            info!("skipping {:?} frame", frame.kind);
            continue;
        }
        match open_frame(&mut frame, &mut fec) {
            Ok((inner, fixed)) => {
                corrected += fixed;
                data.extend_from_slice(&inner);
            }
            Err(e) if e.is_frame_local() => {
                warn!("frame lost: {}", e);
                lost += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    println!(
        "Decoded {} bytes ({} bytes corrected, {} frames lost)",
        data.len(),
        corrected,
        lost
    );
    std::fs::write(output_path, &data)?;
    println!("Wrote {}", output_path.display());
    Ok(())
}

fn loopback_engine(config: &EngineConfig, seed: &[u8]) -> CliResult<Engine> {
    let mut engine = Engine::with_config(config.clone())?;
    engine.initialize(seed)?;
    Ok(engine)
}

fn deliver(engine: &mut Engine, pcm: &[i16]) -> CliResult<()> {
    match engine.state() {
        EngineState::Handshaking(_) => engine.poll_handshake(pcm)?,
        EngineState::Established => engine.handle_incoming_frame(pcm)?,
        _ => {}
    }
    Ok(())
}

/// Exchange one chunk of audio in each direction.
fn exchange(a: &mut Engine, b: &mut Engine, to_b: &mut [i16], to_a: &mut [i16]) -> CliResult<()> {
    a.generate_outgoing_frame(to_b);
    b.generate_outgoing_frame(to_a);
    deliver(b, to_b)?;
    deliver(a, to_a)?;
    Ok(())
}

fn loopback_command(
    message: &str,
    server_seed: Option<&str>,
    client_seed: Option<&str>,
    config: Option<&str>,
) -> CliResult<()> {
    let config = load_config(config)?;
    let server_seed = match server_seed {
        Some(seed) => decode_seed(seed)?,
        None => vec![0x5E; 32],
    };
    let client_seed = match client_seed {
        Some(seed) => decode_seed(seed)?,
        None => vec![0xC1; 32],
    };

    let mut server = loopback_engine(&config, &server_seed)?;
    let mut client = loopback_engine(&config, &client_seed)?;
    server.start_server(&derive_public_key(&client_seed)?)?;
    client.start_client(&derive_public_key(&server_seed)?)?;

    let mut to_server = vec![0i16; LOOPBACK_CHUNK];
    let mut to_client = vec![0i16; LOOPBACK_CHUNK];
    // The handshake timeout bounds this loop; give it one extra timeout of slack
    let budget = 2 * config.ms_to_samples(config.handshake_timeout_ms) / LOOPBACK_CHUNK as u64 + 1;

    let mut rounds = 0u64;
    while !(client.state() == EngineState::Established && server.state() == EngineState::Established) {
        let failed = [client.state(), server.state()]
            .iter()
            .any(|state| matches!(state, EngineState::Terminated(_)));
        if failed || rounds >= budget {
            return Err(format!(
                "Handshake failed: client {}, server {}",
                client.state(),
                server.state()
            )
            .into());
        }
        exchange(&mut client, &mut server, &mut to_server, &mut to_client)?;
        rounds += 1;
    }
    println!("Session established after {} samples", rounds * LOOPBACK_CHUNK as u64);

    for chunk in message.as_bytes().chunks(MAX_PAYLOAD_SIZE) {
        client.send_data(chunk)?;
    }
    client.send_hangup_signal()?;

    let mut received = Vec::new();
    let mut rounds = 0u64;
    while !server.consume_remote_hangup() {
        if rounds >= budget {
            return Err("Hangup never reached the server".into());
        }
        exchange(&mut client, &mut server, &mut to_server, &mut to_client)?;
        while let Some(payload) = server.pull_data() {
            received.extend(payload);
        }
        rounds += 1;
    }
    while let Some(payload) = server.pull_data() {
        received.extend(payload);
    }

    client.stop()?;
    server.stop()?;

    println!("Server received: {}", String::from_utf8_lossy(&received));
    for (name, engine) in [("client", &client), ("server", &server)] {
        for event in engine.drain_events() {
            info!("{} event: {}", name, serde_json::to_string(&event)?);
        }
        let stats = engine.stats();
        println!("{} loss rate: {:.3}", name, stats.loss_rate());
        println!("{} stats: {}", name, serde_json::to_string_pretty(&stats)?);
    }
    Ok(())
}
