//! Runtime tunables. Every knob has a fixed default and may be overridden
//! through a `PORTALS4_*` environment variable, read once on first use.

use spin::Once;

#[derive(Clone, Debug)]
pub struct Params {
    /// Command/send buffers carved out of each shared slab.
    pub num_sbufs: u32,
    /// Hard cap on unacknowledged RDMA work requests per transfer.
    pub max_rdma_wr_out: u32,
    /// Post this many unsignaled sends before requesting a completion.
    pub send_comp_threshold: u32,
    /// Scatter/gather entries a single work request may carry.
    pub max_qp_send_sge: usize,
    /// Largest payload sent inline with a request over the fabric.
    pub max_inline_data: usize,
    /// Sleep between polls once the bounded spin is exhausted.
    pub poll_interval_us: u64,
    /// Attempts per connection stage before the peer is declared dead.
    pub connect_retry_max: u32,
    /// 100ms ticks to wait for a peer-created shared region to appear.
    pub region_try_count: u32,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            num_sbufs: 64,
            max_rdma_wr_out: 8,
            send_comp_threshold: 16,
            max_qp_send_sge: 16,
            max_inline_data: 512,
            poll_interval_us: 100,
            connect_retry_max: 3,
            region_try_count: 100,
        }
    }
}

fn env_u32(name: &str, default: u32) -> u32 {
    match std::env::var(name) {
        Ok(val) => val.parse().unwrap_or_else(|_| {
            log::warn!("ignoring unparsable {name}={val}");
            default
        }),
        Err(_) => default,
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    match std::env::var(name) {
        Ok(val) => val.parse().unwrap_or_else(|_| {
            log::warn!("ignoring unparsable {name}={val}");
            default
        }),
        Err(_) => default,
    }
}

static PARAMS: Once<Params> = Once::new();

/// The process-wide parameter block.
pub fn params() -> &'static Params {
    PARAMS.call_once(|| {
        let d = Params::default();
        Params {
            num_sbufs: env_u32("PORTALS4_NUM_SBUF", d.num_sbufs).max(2),
            max_rdma_wr_out: env_u32("PORTALS4_MAX_RDMA_WR_OUT", d.max_rdma_wr_out).max(1),
            send_comp_threshold: env_u32(
                "PORTALS4_SEND_COMP_THRESHOLD",
                d.send_comp_threshold,
            )
            .max(1),
            max_qp_send_sge: env_u32("PORTALS4_MAX_QP_SEND_SGE", d.max_qp_send_sge as u32)
                .max(1) as usize,
            max_inline_data: env_u32("PORTALS4_MAX_INLINE_DATA", d.max_inline_data as u32)
                as usize,
            poll_interval_us: env_u64("PORTALS4_POLL_INTERVAL_US", d.poll_interval_us),
            connect_retry_max: env_u32("PORTALS4_CONNECT_RETRY", d.connect_retry_max),
            region_try_count: env_u32("PORTALS4_REGION_TRY_COUNT", d.region_try_count).max(1),
        }
    })
}
