//! Feature extraction, normalization and processing stages.

pub mod cmvn;
pub mod extractor;
pub mod processor;

pub use cmvn::{compute_stats, shared, CmvnNormalizer, ConstantCmvn, SharedCmvn, SlidingCmvn};
pub use extractor::{
    FbankExtractor, FbankOptions, FrameTraits, MfccExtractor, MfccOptions, MixType,
    MixtureExtractor, MixtureOptions, SpectrogramExtractor, SpectrogramOptions,
};
pub use processor::{FeatureProcessor, ProcessFn, ProcessorOptions};
