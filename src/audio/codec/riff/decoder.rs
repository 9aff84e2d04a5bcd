use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::codec::adpcm::AdpcmImaDecoder;
use crate::audio::codec::g711::{Companding, g711_decoder};
use crate::audio::codec::io::{InputStream, SharedStream, read_exact_cancellable};
use crate::audio::codec::pcm::raw_pcm_decoder;
use crate::audio::codec::riff::RIFF;
use crate::audio::codec::riff::data::RiffDataReader;
use crate::audio::codec::riff::header::{FMT_TAG, MAX_FMT_LEN, MIN_FMT_LEN, RIFF_TAG, WAVE_TAG, WaveHeader};
use crate::audio::codec::{AudioDecoder, CodecContext, InitializationResult};
use crate::audio::format::{AudioSampleFormat, WaveFormat};
use crate::audio::params::create_codec_params;
use crate::common::{CodecError, Result};

/// Reads `.wav` streams by parsing the header and handing the `data`
/// payload to the matching inner decoder.
pub struct RiffWaveDecoder {
    context: CodecContext,
    header: Option<WaveHeader>,
    inner: Option<Box<dyn AudioDecoder>>,
    stream: Option<SharedStream<InputStream>>,
    owns_stream: bool,
}

impl RiffWaveDecoder {
    pub fn new(context: CodecContext) -> Self {
        Self {
            context,
            header: None,
            inner: None,
            stream: None,
            owns_stream: true,
        }
    }

    /// Encoding found in the header, once initialized.
    pub fn encoding(&self) -> Option<WaveFormat> {
        self.header.map(|h| h.encoding)
    }

    fn inner_decoder(&self, header: &WaveHeader) -> Result<Box<dyn AudioDecoder>> {
        let context = self.context.clone();
        Ok(match header.encoding {
            WaveFormat::Int16LE | WaveFormat::Int24LE | WaveFormat::Int32LE | WaveFormat::Float32LE => {
                Box::new(raw_pcm_decoder(header.encoding, header.format, context)?)
            }
            WaveFormat::ALaw => Box::new(g711_decoder(Companding::ALaw, header.format, context)),
            WaveFormat::MuLaw => Box::new(g711_decoder(Companding::MuLaw, header.format, context)),
            WaveFormat::AdpcmIma => Box::new(AdpcmImaDecoder::new(
                header.format,
                header.block_align as usize,
                context,
            )?),
            other => {
                return Err(CodecError::unsupported(format!("{} payloads", other)));
            }
        })
    }

    /// Reads the RIFF preamble and the leading `fmt ` chunk.
    async fn read_header<R>(input: &mut R, cancel: &CancellationToken) -> Result<Option<Vec<u8>>>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut preamble = [0u8; 20];
        if !read_exact_cancellable(input, &mut preamble, cancel).await? {
            debug!("stream ended inside the RIFF preamble");
            return Ok(None);
        }
        if &preamble[0..4] != RIFF_TAG || &preamble[8..12] != WAVE_TAG {
            debug!("missing RIFF/WAVE tags");
            return Ok(None);
        }
        if &preamble[12..16] != FMT_TAG {
            debug!(
                tag = %String::from_utf8_lossy(&preamble[12..16]),
                "first chunk is not fmt"
            );
            return Ok(None);
        }

        let fmt_len = LittleEndian::read_u32(&preamble[16..20]) as usize;
        if !(MIN_FMT_LEN..=MAX_FMT_LEN).contains(&fmt_len) {
            debug!(len = fmt_len, "fmt chunk length out of range");
            return Ok(None);
        }
        let mut body = vec![0u8; fmt_len + fmt_len % 2];
        if !read_exact_cancellable(input, &mut body, cancel).await? {
            debug!("stream ended inside the fmt chunk");
            return Ok(None);
        }
        body.truncate(fmt_len);
        Ok(Some(body))
    }
}

#[async_trait]
impl AudioDecoder for RiffWaveDecoder {
    fn codec_name(&self) -> String {
        match &self.inner {
            Some(inner) => format!("{}-{}", RIFF, inner.codec_name()),
            None => RIFF.to_string(),
        }
    }

    fn codec_params(&self) -> Option<String> {
        self.output_format().map(|f| create_codec_params(&f))
    }

    fn output_format(&self) -> Option<AudioSampleFormat> {
        self.header.map(|h| h.format)
    }

    fn is_initialized(&self) -> bool {
        self.inner.is_some()
    }

    fn playback_end_of_stream(&self) -> bool {
        self.inner.as_ref().is_some_and(|i| i.playback_end_of_stream())
    }

    async fn initialize(
        &mut self,
        input: InputStream,
        owns_stream: bool,
        cancel: &CancellationToken,
    ) -> Result<InitializationResult> {
        if self.inner.is_some() {
            return Ok(InitializationResult::AlreadyInitialized);
        }

        // Held from here on so a failed open still hands a borrowed stream back.
        let shared = SharedStream::new(input);
        self.stream = Some(shared.clone());
        self.owns_stream = owns_stream;

        let mut header_reader = shared.clone();
        let Some(body) = Self::read_header(&mut header_reader, cancel).await? else {
            return Ok(InitializationResult::FailedInvalidData);
        };
        let header = match WaveHeader::parse(&body) {
            Ok(header) => header,
            Err(CodecError::UnsupportedFormat(reason)) => {
                warn!(%reason, "unsupported wave format");
                return Ok(InitializationResult::FailedUnsupportedFormat);
            }
            Err(e) => {
                warn!(error = %e, "malformed wave header");
                return Ok(InitializationResult::FailedInvalidData);
            }
        };
        let mut inner = match self.inner_decoder(&header) {
            Ok(inner) => inner,
            Err(e) => {
                warn!(encoding = %header.encoding, error = %e, "no decoder for wave payload");
                return Ok(InitializationResult::FailedUnsupportedFormat);
            }
        };

        let data = RiffDataReader::new(shared);
        let result = inner.initialize(Box::new(data), true, cancel).await?;
        if !result.is_success() {
            return Ok(result);
        }

        info!(
            encoding = %header.encoding,
            format = %header.format,
            block_align = header.block_align,
            "wave stream opened"
        );
        self.header = Some(header);
        self.inner = Some(inner);
        Ok(InitializationResult::Success)
    }

    async fn read(
        &mut self,
        buffer: &mut [f32],
        samples_per_channel: usize,
        cancel: &CancellationToken,
    ) -> Result<Option<usize>> {
        match self.inner.as_mut() {
            Some(inner) => inner.read(buffer, samples_per_channel, cancel).await,
            None => Err(CodecError::invalid_usage("decoder is not initialized")),
        }
    }

    async fn dispose(self: Box<Self>) -> Result<Option<InputStream>> {
        if let Some(inner) = self.inner {
            inner.dispose().await?;
        }
        let stream = self.stream.and_then(|shared| shared.take());
        Ok(if self.owns_stream { None } else { stream })
    }
}
