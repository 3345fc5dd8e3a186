//! Compact string form of a topology, e.g. `"32-64-max-128-256"`.
//!
//! Tokens are separated by `-`. Two consecutive numeric tokens form a skip block with these
//! feature widths, `max` and `mean` form pooling blocks. Parameters that differ from the
//! defaults follow the last token of a block as `_`-separated options: `k{h}x{w}` for the
//! kernel or pooling window, `s{h}x{w}` for the stride and `valid` or `same` for the padding
//! of skip blocks, e.g. `"32-64_k5x5_valid-max_s1x1"`.
use std::{fmt, str::FromStr};

use ml::convolutions::Padding;

use crate::{
    errors::{CnnError, CnnResult},
    layers::{LayerSpec, PoolBlock, PoolingType, SkipBlock, OPTION_SEPARATOR},
};

pub const SEPARATOR: char = '-';

/// Ordered sequence of layer specifications.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Topology(Vec<LayerSpec>);

impl Topology {
    pub fn new(layers: Vec<LayerSpec>) -> Self {
        Self(layers)
    }

    pub fn layers(&self) -> &[LayerSpec] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Identity hash: the canonical tokens joined in order. Used to address checkpoints
    /// and logs.
    pub fn identity(&self) -> String {
        encode(&self.0)
    }
}

impl From<Vec<LayerSpec>> for Topology {
    fn from(layers: Vec<LayerSpec>) -> Self {
        Self(layers)
    }
}

impl FromStr for Topology {
    type Err = CnnError;

    fn from_str(s: &str) -> CnnResult<Self> {
        decode(s).map(Self)
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identity())
    }
}

impl<'a> IntoIterator for &'a Topology {
    type Item = &'a LayerSpec;
    type IntoIter = std::slice::Iter<'a, LayerSpec>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Parses a topology string. The empty string is the empty topology.
pub fn decode(topology: &str) -> CnnResult<Vec<LayerSpec>> {
    if topology.is_empty() {
        return Ok(vec![]);
    }
    let tokens: Vec<&str> = topology.split(SEPARATOR).collect();
    let mut layers = Vec::new();
    let mut position = 0;
    while position < tokens.len() {
        let token = tokens[position];
        let (head, options) = split_options(token);
        if head.is_empty() {
            return Err(malformed(position, token, "empty token"));
        }
        if is_numeric(head) {
            if !options.is_empty() {
                return Err(malformed(
                    position,
                    token,
                    "options follow the second feature width of a skip block",
                ));
            }
            let feature_width_1 = parse_width(position, head)?;
            let second = tokens.get(position + 1).ok_or_else(|| {
                malformed(
                    position,
                    token,
                    "a skip block needs a second feature width",
                )
            })?;
            let (second_head, second_options) = split_options(second);
            if !is_numeric(second_head) {
                return Err(malformed(
                    position + 1,
                    second,
                    "expected the second feature width of a skip block",
                ));
            }
            let feature_width_2 = parse_width(position + 1, second_head)?;
            let block = SkipBlock::new(feature_width_1, feature_width_2);
            let options = BlockOptions::parse(position + 1, second, &second_options)?;
            layers.push(options.apply_skip(block).into());
            position += 2;
        } else {
            let pooling_type = PoolingType::from_name(head).ok_or_else(|| {
                malformed(position, token, "unknown pooling type, expected max or mean")
            })?;
            let block = PoolBlock::new(pooling_type);
            let options = BlockOptions::parse(position, token, &options)?;
            layers.push(options.apply_pool(position, token, block)?.into());
            position += 1;
        }
    }
    Ok(layers)
}

/// Joins the canonical tokens of the layers.
pub fn encode(layers: &[LayerSpec]) -> String {
    layers
        .iter()
        .map(LayerSpec::to_string)
        .collect::<Vec<_>>()
        .join(&SEPARATOR.to_string())
}

/// Non-default parameters given as token options.
#[derive(Debug, Default)]
struct BlockOptions {
    kernel: Option<(usize, usize)>,
    stride: Option<(usize, usize)>,
    padding: Option<Padding>,
}

impl BlockOptions {
    fn parse(position: usize, token: &str, options: &[&str]) -> CnnResult<Self> {
        let mut parsed = Self::default();
        for option in options {
            let repeated = match *option {
                "same" => parsed.padding.replace(Padding::Same).is_some(),
                "valid" => parsed.padding.replace(Padding::Valid).is_some(),
                _ => {
                    if let Some(size) = option.strip_prefix('k') {
                        let size = parse_size(position, token, size)?;
                        parsed.kernel.replace(size).is_some()
                    } else if let Some(size) = option.strip_prefix('s') {
                        let size = parse_size(position, token, size)?;
                        parsed.stride.replace(size).is_some()
                    } else {
                        return Err(malformed(
                            position,
                            token,
                            "unknown option, expected k{h}x{w}, s{h}x{w}, same or valid",
                        ));
                    }
                }
            };
            if repeated {
                return Err(malformed(position, token, "repeated option"));
            }
        }
        Ok(parsed)
    }

    fn apply_skip(&self, mut block: SkipBlock) -> SkipBlock {
        if let Some(kernel) = self.kernel {
            block = block.with_kernel(kernel);
        }
        if let Some(stride) = self.stride {
            block = block.with_stride(stride);
        }
        if let Some(padding) = self.padding {
            block = block.with_padding(padding);
        }
        block
    }

    fn apply_pool(
        &self,
        position: usize,
        token: &str,
        mut block: PoolBlock,
    ) -> CnnResult<PoolBlock> {
        if self.padding.is_some() {
            return Err(malformed(
                position,
                token,
                "pooling blocks always use valid padding",
            ));
        }
        if let Some(kernel) = self.kernel {
            block = block.with_kernel(kernel);
        }
        if let Some(stride) = self.stride {
            block = block.with_stride(stride);
        }
        Ok(block)
    }
}

/// Splits `max_k3x3_s1x1` into `max` and its options.
fn split_options(token: &str) -> (&str, Vec<&str>) {
    let mut parts = token.split(OPTION_SEPARATOR);
    let head = parts.next().unwrap_or("");
    (head, parts.collect())
}

fn parse_size(position: usize, token: &str, size: &str) -> CnnResult<(usize, usize)> {
    let dims: Vec<&str> = size.split('x').collect();
    match dims.as_slice() {
        [h, w] if is_numeric(h) && is_numeric(w) => match (h.parse(), w.parse()) {
            (Ok(h), Ok(w)) if h > 0 && w > 0 => Ok((h, w)),
            _ => Err(malformed(position, token, "sizes have to be positive")),
        },
        _ => Err(malformed(position, token, "expected a size like 3x3")),
    }
}

fn is_numeric(token: &str) -> bool {
    !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit())
}

fn parse_width(position: usize, token: &str) -> CnnResult<usize> {
    match token.parse::<usize>() {
        Ok(0) => Err(malformed(position, token, "feature widths have to be positive")),
        Ok(width) => Ok(width),
        Err(_) => Err(malformed(position, token, "feature width is too large")),
    }
}

fn malformed(position: usize, token: &str, reason: &str) -> CnnError {
    CnnError::MalformedTopology {
        position,
        token: token.to_string(),
        reason: reason.to_string(),
    }
}
