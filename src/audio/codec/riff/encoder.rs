use std::io::SeekFrom;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::codec::adpcm::AdpcmImaEncoder;
use crate::audio::codec::g711::{Companding, g711_encoder};
use crate::audio::codec::io::{OutputStream, SharedStream, write_all_cancellable};
use crate::audio::codec::pcm::raw_pcm_encoder;
use crate::audio::codec::riff::RIFF;
use crate::audio::codec::riff::header::WaveHeader;
use crate::audio::codec::{AudioEncoder, CodecContext, EncoderState, InitializationResult};
use crate::audio::format::{AudioSampleFormat, WaveFormat};
use crate::common::{CodecError, Result};

/// Writes `.wav` streams: a provisional header, then the payload of an
/// inner encoder. On finish the header is rewritten with the final lengths
/// when the output can seek.
pub struct RiffWaveEncoder {
    header: WaveHeader,
    inner: Box<dyn AudioEncoder>,
    stream: Option<SharedStream<OutputStream>>,
    owns_stream: bool,
    header_start: u64,
    state: EncoderState,
}

impl RiffWaveEncoder {
    /// 16-bit PCM payload.
    pub fn new(format: AudioSampleFormat, context: CodecContext) -> Result<Self> {
        Self::with_encoding(format, WaveFormat::Int16LE, context)
    }

    pub fn with_encoding(format: AudioSampleFormat, encoding: WaveFormat, context: CodecContext) -> Result<Self> {
        let (inner, block_align): (Box<dyn AudioEncoder>, Option<u16>) = match encoding {
            WaveFormat::Int16LE | WaveFormat::Int24LE | WaveFormat::Int32LE | WaveFormat::Float32LE => {
                (Box::new(raw_pcm_encoder(encoding, format, context)?), None)
            }
            WaveFormat::ALaw => (Box::new(g711_encoder(Companding::ALaw, format, context)), None),
            WaveFormat::MuLaw => (Box::new(g711_encoder(Companding::MuLaw, format, context)), None),
            WaveFormat::AdpcmIma => {
                let encoder = AdpcmImaEncoder::new(format, context)?;
                let block_align = u16::try_from(encoder.block_align())
                    .map_err(|_| CodecError::unsupported("ADPCM block too large for a wave header"))?;
                if format.num_channels > 2 {
                    warn!(
                        channels = format.num_channels,
                        "multichannel IMA ADPCM is not widely supported by other decoders"
                    );
                }
                (Box::new(encoder), Some(block_align))
            }
            other => {
                return Err(CodecError::unsupported(format!("wave encoding {}", other)));
            }
        };

        Ok(Self {
            header: WaveHeader::for_encoding(format, encoding, block_align),
            inner,
            stream: None,
            owns_stream: true,
            header_start: 0,
            state: EncoderState::Uninitialized,
        })
    }

    pub fn encoding(&self) -> WaveFormat {
        self.header.encoding
    }
}

/// Seeks back over the header, rewrites it for a file of
/// `end - header_start` bytes, and returns to the end.
async fn rewrite_header(
    header: &WaveHeader,
    header_start: u64,
    stream: &mut OutputStream,
    cancel: &CancellationToken,
) -> Result<()> {
    let Some(end) = stream.position().await? else {
        debug!("output is not seekable; wave lengths stay zero");
        return Ok(());
    };
    let file_len = end.saturating_sub(header_start);
    let bytes = header.build(Some(file_len))?;

    stream.seek_to(SeekFrom::Start(header_start)).await?;
    write_all_cancellable(stream, &bytes, cancel).await?;
    stream.seek_to(SeekFrom::Start(end)).await?;
    debug!(file_len, "wave header rewritten");
    Ok(())
}

#[async_trait]
impl AudioEncoder for RiffWaveEncoder {
    fn codec_name(&self) -> String {
        format!("{}-{}", RIFF, self.inner.codec_name())
    }

    fn codec_params(&self) -> Option<String> {
        None
    }

    fn input_format(&self) -> AudioSampleFormat {
        self.header.format
    }

    fn is_initialized(&self) -> bool {
        self.stream.is_some()
    }

    async fn initialize(
        &mut self,
        mut output: OutputStream,
        owns_stream: bool,
        cancel: &CancellationToken,
    ) -> Result<InitializationResult> {
        if self.stream.is_some() {
            return Ok(InitializationResult::AlreadyInitialized);
        }

        self.header_start = output.position().await?.unwrap_or(0);
        let provisional = self.header.build(None)?;
        write_all_cancellable(&mut output, &provisional, cancel).await?;

        let shared = SharedStream::new(output);
        let result = self
            .inner
            .initialize(OutputStream::plain(shared.clone()), false, cancel)
            .await?;
        self.stream = Some(shared);
        self.owns_stream = owns_stream;
        if result.is_success() {
            self.state = EncoderState::Streaming;
            info!(
                encoding = %self.header.encoding,
                format = %self.header.format,
                extensible = self.header.needs_extensible(),
                "wave encoder initialized"
            );
        }
        Ok(result)
    }

    async fn write(
        &mut self,
        buffer: &[f32],
        samples_per_channel: usize,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.state.ensure_writable()?;
        self.inner.write(buffer, samples_per_channel, cancel).await
    }

    async fn finish(&mut self, cancel: &CancellationToken) -> Result<()> {
        match self.state {
            EncoderState::Uninitialized => Err(CodecError::invalid_usage("encoder is not initialized")),
            EncoderState::Finished => Ok(()),
            EncoderState::Streaming => {
                self.inner.finish(cancel).await?;

                let shared = self
                    .stream
                    .as_ref()
                    .ok_or_else(|| CodecError::invalid_usage("encoder is not initialized"))?
                    .clone();
                let mut stream = shared
                    .take()
                    .ok_or_else(|| CodecError::invalid_usage("output stream is detached"))?;
                let rewritten = rewrite_header(&self.header, self.header_start, &mut stream, cancel).await;
                let flushed = stream.flush().await;
                shared.restore(stream);
                rewritten?;
                flushed?;

                self.state = EncoderState::Finished;
                Ok(())
            }
        }
    }

    async fn dispose(self: Box<Self>) -> Result<Option<OutputStream>> {
        if self.state == EncoderState::Streaming {
            warn!(codec = RIFF, "encoder disposed without finish");
        }
        self.inner.dispose().await?;

        let Some(mut stream) = self.stream.and_then(|shared| shared.take()) else {
            return Ok(None);
        };
        if self.owns_stream {
            stream.shutdown().await?;
            Ok(None)
        } else {
            stream.flush().await?;
            Ok(Some(stream))
        }
    }
}
