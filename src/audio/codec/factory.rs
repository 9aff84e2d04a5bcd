//! Codec lookup by name.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use crate::audio::codec::adpcm::AdpcmCodecFactory;
use crate::audio::codec::g711::G711CodecFactory;
use crate::audio::codec::pcm::RawPcmCodecFactory;
use crate::audio::codec::riff::RiffWaveCodecFactory;
use crate::audio::codec::sqrt::SquareDeltaCodecFactory;
use crate::audio::codec::{AudioDecoder, AudioEncoder, CodecContext};
use crate::audio::format::AudioSampleFormat;
use crate::common::{CodecError, Result};
use crate::configs::OpusConfig;

/// Builds codec instances for the names it advertises.
pub trait CodecFactory: Send + Sync {
    fn supported_decode_formats(&self) -> Vec<String>;

    fn supported_encode_formats(&self) -> Vec<String>;

    fn can_decode(&self, codec: &str) -> bool {
        self.supported_decode_formats().iter().any(|c| c == codec)
    }

    fn can_encode(&self, codec: &str) -> bool {
        self.supported_encode_formats().iter().any(|c| c == codec)
    }

    /// `codec_params` carries the out-of-band format for headerless codecs.
    fn create_decoder(&self, codec: &str, codec_params: Option<&str>) -> Result<Box<dyn AudioDecoder>>;

    fn create_encoder(&self, codec: &str, input_format: AudioSampleFormat) -> Result<Box<dyn AudioEncoder>>;
}

/// Dispatches to the first member factory that serves a name.
#[derive(Default)]
pub struct AggregateCodecFactory {
    factories: Vec<Arc<dyn CodecFactory>>,
}

impl AggregateCodecFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, factory: impl CodecFactory + 'static) -> Self {
        self.factories.push(Arc::new(factory));
        self
    }

    pub fn push(&mut self, factory: Arc<dyn CodecFactory>) {
        self.factories.push(factory);
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl CodecFactory for AggregateCodecFactory {
    fn supported_decode_formats(&self) -> Vec<String> {
        let names: BTreeSet<String> = self
            .factories
            .iter()
            .flat_map(|f| f.supported_decode_formats())
            .collect();
        names.into_iter().collect()
    }

    fn supported_encode_formats(&self) -> Vec<String> {
        let names: BTreeSet<String> = self
            .factories
            .iter()
            .flat_map(|f| f.supported_encode_formats())
            .collect();
        names.into_iter().collect()
    }

    fn can_decode(&self, codec: &str) -> bool {
        self.factories.iter().any(|f| f.can_decode(codec))
    }

    fn can_encode(&self, codec: &str) -> bool {
        self.factories.iter().any(|f| f.can_encode(codec))
    }

    fn create_decoder(&self, codec: &str, codec_params: Option<&str>) -> Result<Box<dyn AudioDecoder>> {
        let factory = self.factories.iter().find(|f| f.can_decode(codec)).ok_or_else(|| {
            CodecError::unsupported(format!(
                "no decoder for \"{}\" (available: {})",
                codec,
                self.supported_decode_formats().join(", ")
            ))
        })?;
        debug!(codec, params = ?codec_params, "creating decoder");
        factory.create_decoder(codec, codec_params)
    }

    fn create_encoder(&self, codec: &str, input_format: AudioSampleFormat) -> Result<Box<dyn AudioEncoder>> {
        let factory = self.factories.iter().find(|f| f.can_encode(codec)).ok_or_else(|| {
            CodecError::unsupported(format!(
                "no encoder for \"{}\" (available: {})",
                codec,
                self.supported_encode_formats().join(", ")
            ))
        })?;
        debug!(codec, format = %input_format, "creating encoder");
        factory.create_encoder(codec, input_format)
    }
}

/// Every codec this build provides.
#[cfg_attr(not(feature = "native-opus"), allow(unused_variables))]
pub fn default_factory(context: CodecContext, opus: &OpusConfig) -> AggregateCodecFactory {
    let factory = AggregateCodecFactory::new()
        .with(RawPcmCodecFactory::new(context.clone()))
        .with(G711CodecFactory::new(context.clone()))
        .with(SquareDeltaCodecFactory::new(context.clone()))
        .with(AdpcmCodecFactory::new(context.clone()))
        .with(RiffWaveCodecFactory::new(context.clone()));

    #[cfg(feature = "native-opus")]
    let factory = {
        use crate::audio::codec::opus::native::AudiopusProvider;
        use crate::audio::codec::opus::{OpusOggCodecFactory, OpusProvider, OpusRawCodecFactory};

        let provider: Arc<dyn OpusProvider> = Arc::new(AudiopusProvider);
        factory
            .with(OpusRawCodecFactory::new(context.clone(), Arc::clone(&provider), opus.clone()))
            .with(OpusOggCodecFactory::new(context, provider, opus.clone()))
    };

    factory
}
