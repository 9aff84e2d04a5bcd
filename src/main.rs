use std::path::PathBuf;

use streamcodec::audio::buffer::{BufferPool, BufferPools, PooledBuffer};
use streamcodec::audio::codec::{AudioDecoder, AudioEncoder, CodecContext, CodecFactory, OutputStream, default_factory};
use streamcodec::common::{CodecError, logger};
use streamcodec::configs::Config;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Frames per decoded chunk handed to the encoder task.
const CHUNK_FRAMES: usize = 4096;
/// Chunks in flight between the two tasks.
const PIPELINE_DEPTH: usize = 8;

const USAGE: &str = "usage: streamcodec <input> <output> --from <codec> [--params <str>] --to <codec>";

struct Args {
    input: PathBuf,
    output: PathBuf,
    from: String,
    params: Option<String>,
    to: String,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Args, String> {
    let mut positional = Vec::new();
    let mut from = None;
    let mut params = None;
    let mut to = None;

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        let slot = match arg.as_str() {
            "--from" => &mut from,
            "--params" => &mut params,
            "--to" => &mut to,
            "-h" | "--help" => return Err(USAGE.to_string()),
            flag if flag.starts_with("--") => return Err(format!("unknown flag {}\n{}", flag, USAGE)),
            _ => {
                positional.push(arg);
                continue;
            }
        };
        *slot = Some(args.next().ok_or_else(|| format!("{} needs a value\n{}", arg, USAGE))?);
    }

    let [input, output] = <[String; 2]>::try_from(positional).map_err(|_| USAGE.to_string())?;
    Ok(Args {
        input: input.into(),
        output: output.into(),
        from: from.ok_or_else(|| format!("--from is required\n{}", USAGE))?,
        params,
        to: to.ok_or_else(|| format!("--to is required\n{}", USAGE))?,
    })
}

async fn decode_loop(
    mut decoder: Box<dyn AudioDecoder>,
    pool: BufferPool<f32>,
    channels: usize,
    tx: flume::Sender<PooledBuffer<f32>>,
    cancel: CancellationToken,
) -> Result<u64, CodecError> {
    let mut frames = 0u64;
    loop {
        let mut chunk = pool.rent(CHUNK_FRAMES * channels);
        let Some(n) = decoder.read(&mut chunk, CHUNK_FRAMES, &cancel).await? else {
            break;
        };
        chunk.set_len(n * channels);
        frames += n as u64;
        if tx.send_async(chunk).await.is_err() {
            debug!("encoder stopped; ending decode");
            break;
        }
    }
    decoder.dispose().await?;
    Ok(frames)
}

async fn encode_loop(
    mut encoder: Box<dyn AudioEncoder>,
    channels: usize,
    rx: flume::Receiver<PooledBuffer<f32>>,
    cancel: CancellationToken,
) -> Result<u64, CodecError> {
    let mut frames = 0u64;
    while let Ok(chunk) = rx.recv_async().await {
        let n = chunk.len() / channels;
        encoder.write(&chunk, n, &cancel).await?;
        frames += n as u64;
    }
    encoder.finish(&cancel).await?;
    encoder.dispose().await?;
    Ok(frames)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load().map_err(|e| e as Box<dyn std::error::Error>)?;
    logger::init(config.logging.as_ref());

    let args = parse_args(std::env::args().skip(1))?;
    info!(version = env!("CARGO_PKG_VERSION"), "streamcodec starting");

    let pools = BufferPools::new(config.pool);
    let context = CodecContext::new(pools.clone()).with_realtime_budget(config.decoding.realtime_budget());
    let factory = default_factory(context, &config.opus);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted; cancelling");
                cancel.cancel();
            }
        }
    });

    let mut decoder = factory.create_decoder(&args.from, args.params.as_deref())?;
    let input = tokio::fs::File::open(&args.input).await?;
    let opened = decoder.initialize(Box::new(input), true, &cancel).await?;
    if !opened.is_success() {
        return Err(format!("cannot decode {}: {:?}", args.input.display(), opened).into());
    }
    let format = decoder
        .output_format()
        .ok_or("decoder did not report its output format")?;
    info!(codec = %decoder.codec_name(), format = %format, "input opened");

    let mut encoder = factory.create_encoder(&args.to, format)?;
    let output = tokio::fs::File::create(&args.output).await?;
    let bound = encoder
        .initialize(OutputStream::seekable(output), true, &cancel)
        .await?;
    if !bound.is_success() {
        return Err(format!("cannot encode to {}: {:?}", args.output.display(), bound).into());
    }
    if let Some(params) = encoder.codec_params() {
        info!(codec = %encoder.codec_name(), %params, "output params");
    }

    let (tx, rx) = flume::bounded(PIPELINE_DEPTH);
    let channels = format.num_channels;
    let decode = tokio::spawn(decode_loop(decoder, pools.samples.clone(), channels, tx, cancel.clone()));
    let encode = tokio::spawn(encode_loop(encoder, channels, rx, cancel.clone()));

    let (decoded, encoded) = match (decode.await?, encode.await?) {
        (Ok(decoded), Ok(encoded)) => (decoded, encoded),
        (Err(e), _) | (_, Err(e)) => {
            error!(error = %e, "transcode failed");
            return Err(e.into());
        }
    };

    let stats = pools.samples.stats();
    info!(
        decoded_frames = decoded,
        encoded_frames = encoded,
        seconds = decoded as f64 / format.sample_rate_hz as f64,
        pooled_allocations = stats.pooled_allocations,
        reclaimed = stats.reclaimed,
        "transcode complete"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(line: &str) -> Vec<String> {
        line.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn parses_flags_in_any_order() {
        let parsed = parse_args(args("--to riff in.raw --from alaw out.wav --params samplerate=8000")).unwrap();
        assert_eq!(parsed.input, PathBuf::from("in.raw"));
        assert_eq!(parsed.output, PathBuf::from("out.wav"));
        assert_eq!(parsed.from, "alaw");
        assert_eq!(parsed.to, "riff");
        assert_eq!(parsed.params.as_deref(), Some("samplerate=8000"));
    }

    #[test]
    fn rejects_incomplete_command_lines() {
        assert!(parse_args(args("in.wav out.wav --from riff")).is_err());
        assert!(parse_args(args("in.wav --from riff --to riff")).is_err());
        assert!(parse_args(args("in.wav out.wav --from riff --to")).is_err());
        assert!(parse_args(args("in.wav out.wav --from riff --to riff --speed 2")).is_err());
    }
}
