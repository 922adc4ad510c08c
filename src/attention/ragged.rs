//! Ragged attention over the paged pool
//!
//! Each batch row reads only the blocks listed in its own block table, in
//! logical order, and tiles the key axis like the flash path. Rows of
//! different lengths share one pool without padding.

use numr::dtype::DType;
use numr::ops::IndexingOps;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

use super::AttentionInput;
use super::kernel::{HeadGeometry, blockwise_attention};
use crate::cache::{BlockTable, RaggedCache};
use crate::client::CacheClient;
use crate::error::Result;
use crate::mask::MaskBuilder;

/// One decode (or chunked prefill) step for every slot of a ragged cache.
///
/// Writes for the whole batch are staged first and committed after all rows
/// have attended. Under lazy update a row therefore sees its new tokens only
/// through the appended block, and no row ever sees another row's blocks.
pub(crate) fn ragged_step<R, C>(
    client: &C,
    input: &AttentionInput<'_, R>,
    cache: &mut RaggedCache<R>,
    builder: &MaskBuilder,
    tile_size: usize,
) -> Result<Tensor<R>>
where
    R: Runtime<DType = DType>,
    R::Client: IndexingOps<R>,
    C: CacheClient<R>,
{
    let config = cache.config().clone();
    let q_shape = input.queries.shape().to_vec();
    let (batch, num_heads, t_len, head_dim) = (q_shape[0], q_shape[1], q_shape[2], q_shape[3]);
    let geo = HeadGeometry {
        num_heads,
        num_kv_heads: config.kv_heads(),
        head_dim,
    };
    let page_size = config.ragged_block_size;

    let writes: Vec<(usize, &[usize])> = input
        .positions
        .iter()
        .enumerate()
        .map(|(slot, p)| (slot, p.as_slice()))
        .collect();
    let staged = cache.stage(client, &writes, input.keys, input.values)?;
    let resident = builder.is_resident(t_len);

    let output = {
        let (k_pool, v_pool, tables) = if resident {
            let (k, v) = staged.host_pool(client)?;
            (k, v, staged.tables())
        } else {
            let (k, v) = cache.host_pool(client)?;
            (k, v, cache.tables())
        };
        let (k_block, v_block) = if resident {
            (Vec::new(), Vec::new())
        } else {
            let (k, v) = staged.read_block(client)?;
            (k.contiguous().to_vec::<f32>(), v.contiguous().to_vec::<f32>())
        };

        let q_data = input.queries.contiguous().to_vec::<f32>();
        let q_stride = num_heads * t_len * head_dim;
        let mut output = Vec::with_capacity(batch * q_stride);

        for (b, queries) in input.positions.iter().enumerate() {
            let start = queries[0];
            let cached = if resident { start + t_len } else { start };
            let appended = if resident { None } else { Some((&k_block[..], &v_block[..])) };

            let layout = SeqLayout {
                row: b,
                cached,
                tokens: t_len,
                page_size,
                geo,
            };
            let k_seq = layout.gather(&k_pool, &tables[b], appended.map(|(k, _)| k));
            let v_seq = layout.gather(&v_pool, &tables[b], appended.map(|(_, v)| v));

            let mask = if resident {
                builder.sequence_mask(queries, cached)
            } else {
                builder
                    .sequence_mask(queries, cached)
                    .hstack(&builder.block_mask(queries))?
            };
            tracing::trace!(row = b, cached, blocks = tables[b].num_blocks(), "ragged row");

            output.extend(blockwise_attention(
                &q_data[b * q_stride..(b + 1) * q_stride],
                &k_seq,
                &v_seq,
                &mask,
                geo,
                tile_size,
            ));
        }
        output
    };

    cache.commit(staged);
    Ok(Tensor::<R>::from_slice(&output, &q_shape, input.queries.device()))
}

struct SeqLayout {
    row: usize,
    cached: usize,
    tokens: usize,
    page_size: usize,
    geo: HeadGeometry,
}

impl SeqLayout {
    /// `[H_kv, cached (+ tokens), D]` for one sequence: its cached positions
    /// resolved through `table`, then the step's block rows if appended.
    fn gather(&self, pool: &[f32], table: &BlockTable, appended: Option<&[f32]>) -> Vec<f32> {
        let d = self.geo.head_dim;
        let hkv = self.geo.num_kv_heads;
        let extra = appended.map_or(0, |_| self.tokens);
        let mut out = Vec::with_capacity(hkv * (self.cached + extra) * d);

        for h in 0..hkv {
            for pos in 0..self.cached {
                match table.resolve(pos) {
                    Some((block, off)) => {
                        let src = ((block as usize * hkv + h) * self.page_size + off) * d;
                        out.extend_from_slice(&pool[src..src + d]);
                    }
                    // no block backs this position, so the mask already hides it
                    None => out.extend(std::iter::repeat_n(0.0, d)),
                }
            }
            if let Some(block) = appended {
                let src = (self.row * hkv + h) * self.tokens * d;
                out.extend_from_slice(&block[src..src + self.tokens * d]);
            }
        }
        out
    }
}
