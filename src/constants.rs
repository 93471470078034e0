// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Useful constants.
 */

/// The dispersion constant \[MHz² pc⁻¹ cm³ s\]. Multiplied by the DM and the
/// difference of inverse squared frequencies (in MHz) gives a delay in seconds.
pub(crate) const K_DM: f64 = 4.148808e3;

/// Running whole-run sums are divided by this number before being added, so
/// that long observations don't overflow single-precision accumulators.
pub(crate) const CUMULATIVE_SCALE: f32 = 1000.0;

/// The default gain applied to samples before they are quantised into the
/// filtered 2D output.
pub(crate) const DEFAULT_GAIN: f32 = 8.0 * 1024.0;

/// \[seconds\]
pub(crate) const DEFAULT_BLOCK_DURATION: f64 = 1.0;

/// The default length of each polyco set \[minutes\].
pub(crate) const DEFAULT_POLYCO_SPAN: f64 = 60.0;

/// The default number of coefficients of each polyco set.
pub(crate) const DEFAULT_POLYCO_COEFFS: usize = 12;

/// The default median-smoothing window of the bandshape \[channels\].
pub(crate) const DEFAULT_SMOOTHING_WINDOW: usize = 20;

pub(crate) const DEFAULT_CHANNEL_CUTOFF: f32 = 2.5;
pub(crate) const DEFAULT_TIME_CUTOFF: f32 = 3.0;

/// The default percentage of flagged samples above which a whole flag
/// smoothing window is flagged.
pub(crate) const DEFAULT_FLAG_SMOOTHING_THRESHOLD: f32 = 50.0;

/// Converts a median absolute deviation into a Gaussian sigma.
pub(crate) const MAD_TO_SIGMA: f32 = 1.4826;

/// Converts a full width at half maximum into a Gaussian sigma.
pub(crate) const FWHM_TO_SIGMA: f32 = 2.355;

/// Dedispersed samples built from this fraction of the in-range channels (or
/// fewer) are not used for folding.
pub(crate) const MIN_DEDISPERSED_CHANNEL_FRACTION: f32 = 0.4;

/// The number of blocks that can be in flight at once; one per pipeline stage.
pub(crate) const PIPELINE_DEPTH: usize = 5;

/// Each record of the shared-memory ring starts with this many bytes of
/// metadata.
pub(crate) const RECORD_HEADER_BYTES: usize = 4096;

/// How long to sleep between polls of a shared-memory record that isn't ready.
pub(crate) const RING_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(2);

/// Indian Standard Time is this many seconds ahead of UTC.
pub(crate) const IST_OFFSET_SECONDS: i32 = 5 * 3600 + 30 * 60;

/// The MJD of the Unix epoch (1970-01-01T00:00:00 UTC).
pub(crate) const MJD_UNIX_EPOCH: f64 = 40587.0;

/// Ratios (the leftmost column) and the two-point cutoffs that give the same
/// false-alarm probability as a single-point cutoff at that ratio. Used by the
/// multi-point flagger; rows are spaced by 0.1.
pub(crate) const MULTI_POINT_CUTOFFS: [(f32, f32); 91] = [
    (1.0, 0.559349),
    (1.1, 0.62054),
    (1.2, 0.68246),
    (1.3, 0.745061),
    (1.4, 0.808296),
    (1.5, 0.872124),
    (1.6, 0.936504),
    (1.7, 1.0014),
    (1.8, 1.06677),
    (1.9, 1.13259),
    (2.0, 1.19882),
    (2.1, 1.26543),
    (2.2, 1.33241),
    (2.3, 1.39971),
    (2.4, 1.46733),
    (2.5, 1.53523),
    (2.6, 1.6034),
    (2.7, 1.67182),
    (2.8, 1.74046),
    (2.9, 1.80933),
    (3.0, 1.87839),
    (3.1, 1.94763),
    (3.2, 2.01705),
    (3.3, 2.08662),
    (3.4, 2.15635),
    (3.5, 2.22621),
    (3.6, 2.2962),
    (3.7, 2.36631),
    (3.8, 2.43653),
    (3.9, 2.50685),
    (4.0, 2.57727),
    (4.1, 2.64777),
    (4.2, 2.71836),
    (4.3, 2.78902),
    (4.4, 2.85975),
    (4.5, 2.93055),
    (4.6, 3.00141),
    (4.7, 3.07233),
    (4.8, 3.1433),
    (4.9, 3.21432),
    (5.0, 3.28538),
    (5.1, 3.35648),
    (5.2, 3.42763),
    (5.3, 3.4988),
    (5.4, 3.57001),
    (5.5, 3.64126),
    (5.6, 3.71253),
    (5.7, 3.78382),
    (5.8, 3.85514),
    (5.9, 3.92648),
    (6.0, 3.99784),
    (6.1, 4.06923),
    (6.2, 4.14062),
    (6.3, 4.21204),
    (6.4, 4.28346),
    (6.5, 4.3549),
    (6.6, 4.42635),
    (6.7, 4.49782),
    (6.8, 4.56929),
    (6.9, 4.64077),
    (7.0, 4.71226),
    (7.1, 4.78375),
    (7.2, 4.85525),
    (7.3, 4.92676),
    (7.4, 4.99827),
    (7.5, 5.06978),
    (7.6, 5.1413),
    (7.7, 5.21282),
    (7.8, 5.28435),
    (7.9, 5.35587),
    (8.0, 5.4274),
    (8.1, 5.49893),
    (8.2, 5.57046),
    (8.3, 5.64198),
    (8.4, 5.71351),
    (8.5, 5.78504),
    (8.6, 5.85657),
    (8.7, 5.92809),
    (8.8, 5.99962),
    (8.9, 6.07114),
    (9.0, 6.14266),
    (9.1, 6.21418),
    (9.2, 6.2857),
    (9.3, 6.35721),
    (9.4, 6.42872),
    (9.5, 6.50023),
    (9.6, 6.57174),
    (9.7, 6.64324),
    (9.8, 6.71474),
    (9.9, 6.78624),
    (10.0, 6.85773),
];
