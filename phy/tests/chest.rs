mod support;

use common::types::CyclicPrefix;
use common::utils::power_to_db;
use num_complex::Complex32;
use phy::refsignal::{self, MbsfnSignalSet, ReferenceSignalSet, MBSFN_SYMBOLS_PER_SUBFRAME};
use phy::{
    ChannelEstimateResult, ChannelEstimator, EstimatorAlgorithm, EstimatorConfig, FilterType, FindResult,
    NoiseAlgorithm, SubframeConfig, Synchronizer,
};
use std::f32::consts::PI;
use support::{add_awgn, cell, downlink_grid, init_tracing, scale, Ofdm};

#[test]
fn test_noiseless_pilots_give_unit_estimate() {
    init_tracing();
    for (id, nof_prb, ports, cp) in [
        (1, 6, 1, CyclicPrefix::Normal),
        (88, 25, 2, CyclicPrefix::Normal),
        (301, 15, 4, CyclicPrefix::Extended),
    ] {
        let c = cell(id, nof_prb, cp, ports);
        let mut est = ChannelEstimator::new(nof_prb, 1).unwrap();
        est.set_cell(&c).unwrap();
        let mut res = ChannelEstimateResult::new(nof_prb, 1);
        let set = ReferenceSignalSet::generate(&c).unwrap();

        for sf in [0usize, 3, 5] {
            let mut grid = vec![downlink_grid(&c, sf)];
            est.estimate(&SubframeConfig::new(sf as u32), &EstimatorConfig::default(), &mut grid, &mut res)
                .unwrap();

            // Every pilot of every port reads back as 1 + 0j
            for port in 0..ports as usize {
                let mut pilots = vec![Complex32::new(0.0, 0.0); refsignal::nof_pilots(port, nof_prb)];
                set.get_sf(port, &res.ce[port][0], &mut pilots);
                for p in &pilots {
                    assert!((p - Complex32::new(1.0, 0.0)).norm() < 1e-4, "cell {} port {}: {}", id, port, p);
                }
            }
            assert!((res.rsrp - 1.0).abs() < 1e-4);
        }
    }
}

#[test]
fn test_noise_estimators_track_awgn() {
    init_tracing();
    let c = cell(7, 25, CyclicPrefix::Normal, 1);
    let variance = 0.01;
    let mut clean = downlink_grid(&c, 0);
    scale(&mut clean, Complex32::new(0.6, 0.8));

    let mut noisy = clean.clone();
    add_awgn(&mut noisy, variance, 99);

    for (alg, lo, hi) in [
        (NoiseAlgorithm::PilotDifference, 0.6, 1.5),
        (NoiseAlgorithm::Pss, 0.6, 2.2),
        (NoiseAlgorithm::EmptySubcarrier, 0.3, 2.0),
    ] {
        let cfg = EstimatorConfig {
            noise_alg: alg,
            ..EstimatorConfig::default()
        };
        let mut est = ChannelEstimator::new(25, 1).unwrap();
        est.set_cell(&c).unwrap();
        let mut res = ChannelEstimateResult::new(25, 1);

        est.estimate(&SubframeConfig::new(0), &cfg, &mut [clean.clone()], &mut res)
            .unwrap();
        assert!(res.noise_estimate < 1e-8, "{:?} noiseless estimate {}", alg, res.noise_estimate);

        est.estimate(&SubframeConfig::new(10), &cfg, &mut [noisy.clone()], &mut res)
            .unwrap();
        let ratio = res.noise_estimate / variance;
        assert!(ratio > lo && ratio < hi, "{:?} estimate ratio {}", alg, ratio);
    }
}

#[test]
fn test_estimate_is_repeatable() {
    init_tracing();
    let c = cell(42, 15, CyclicPrefix::Normal, 2);
    let mut grid = downlink_grid(&c, 4);
    add_awgn(&mut grid, 1e-3, 3);

    for alg in [EstimatorAlgorithm::Average, EstimatorAlgorithm::Interpolate] {
        let cfg = EstimatorConfig {
            estimator_alg: alg,
            ..EstimatorConfig::default()
        };
        let mut est = ChannelEstimator::new(15, 1).unwrap();
        est.set_cell(&c).unwrap();
        let mut first = ChannelEstimateResult::new(15, 1);
        let mut second = ChannelEstimateResult::new(15, 1);
        est.estimate(&SubframeConfig::new(4), &cfg, &mut [grid.clone()], &mut first)
            .unwrap();
        est.estimate(&SubframeConfig::new(4), &cfg, &mut [grid.clone()], &mut second)
            .unwrap();
        assert_eq!(first, second);
    }
}

#[test]
fn test_two_antennas() {
    init_tracing();
    let c = cell(9, 6, CyclicPrefix::Normal, 1);
    let h = [Complex32::new(1.0, 0.0), Complex32::new(0.0, 0.5)];
    let mut grids: Vec<Vec<Complex32>> = h
        .iter()
        .map(|g| {
            let mut grid = downlink_grid(&c, 2);
            scale(&mut grid, *g);
            grid
        })
        .collect();

    let mut est = ChannelEstimator::new(6, 2).unwrap();
    est.set_cell(&c).unwrap();
    let mut res = ChannelEstimateResult::new(6, 2);
    est.estimate(&SubframeConfig::new(2), &EstimatorConfig::default(), &mut grids, &mut res)
        .unwrap();

    for (a, g) in h.iter().enumerate() {
        assert!(res.ce[0][a][..c.nof_re()].iter().all(|v| (v - g).norm() < 1e-4));
    }
    // Antenna-averaged power of the only port
    assert!((res.rsrp - (1.0 + 0.25) / 2.0).abs() < 1e-4);
    assert!((res.rsrp_ant_port_dbm[1][0] - (power_to_db(0.25) + 30.0)).abs() < 1e-3);
}

/// Cell 1, 6 PRB, one port at 100 dB SNR: acquire, demodulate, estimate
#[test]
fn test_acquire_then_estimate() {
    init_tracing();
    let c = cell(1, 6, CyclicPrefix::Normal, 1);
    let ofdm = Ofdm::new(6, CyclicPrefix::Normal);
    let amplitude = 0.5f32;
    let tx_power_db = power_to_db(amplitude * amplitude);

    let mut signal = Vec::new();
    for sf in 0..2 {
        let mut grid = downlink_grid(&c, sf);
        scale(&mut grid, Complex32::new(amplitude, 0.0));
        signal.extend(ofdm.modulate(&grid));
    }
    add_awgn(&mut signal, amplitude * amplitude * 1e-10, 1);

    let mut sync = Synchronizer::new(ofdm.subframe_len(), 0, ofdm.fft_size).unwrap();
    sync.set_sector(c.pci.sector_id()).unwrap();
    assert_eq!(sync.find(&signal, 0).unwrap(), FindResult::Found);
    assert_eq!(sync.cell_id(), Some(c.pci));

    let start = sync.peak_position() - ofdm.slot_len();
    let mut grid = vec![ofdm.demodulate(&signal[start..start + ofdm.subframe_len()])];

    let mut est = ChannelEstimator::new(6, 1).unwrap();
    est.set_cell(&c).unwrap();
    let mut res = ChannelEstimateResult::new(6, 1);
    est.estimate(
        &SubframeConfig::new(sync.sf_idx() as u32),
        &EstimatorConfig::default(),
        &mut grid,
        &mut res,
    )
    .unwrap();

    assert!((power_to_db(res.rsrp) - tx_power_db).abs() < 0.5, "RSRP {} dB", power_to_db(res.rsrp));
    assert!(
        res.noise_estimate_dbm <= res.rsrp_dbm - 40.0,
        "noise {} dBm vs RSRP {} dBm",
        res.noise_estimate_dbm,
        res.rsrp_dbm
    );
}

/// Static channel of a single path delayed by `delay` samples in a 512-point FFT
fn delayed_path(k: usize, delay: f32) -> Complex32 {
    Complex32::from_polar(1.0, -2.0 * PI * delay * k as f32 / 512.0)
}

fn apply_channel(grid: &mut [Complex32], nsc: usize, h: impl Fn(usize) -> Complex32) {
    for row in grid.chunks_mut(nsc) {
        for (k, v) in row.iter_mut().enumerate() {
            *v *= h(k);
        }
    }
}

/// Largest estimate error over every symbol, leaving out `edge` subcarriers at both ends
fn max_error(ce: &[Complex32], nsc: usize, edge: usize, h: impl Fn(usize) -> Complex32) -> f32 {
    ce.chunks(nsc)
        .flat_map(|row| row.iter().enumerate().skip(edge).take(nsc - 2 * edge))
        .map(|(k, v)| (v - h(k)).norm())
        .fold(0.0, f32::max)
}

fn mean_sq_error(ce: &[Complex32], nsc: usize, h: impl Fn(usize) -> Complex32) -> f32 {
    let total: f32 = ce
        .chunks(nsc)
        .flat_map(|row| row.iter().enumerate())
        .map(|(k, v)| (v - h(k)).norm_sqr())
        .sum();
    total / ce.len() as f32
}

#[test]
fn test_average_tracks_frequency_selective_channel() {
    init_tracing();
    for (id, ports) in [(7, 1), (10, 2), (23, 4)] {
        let c = cell(id, 25, CyclicPrefix::Normal, ports);
        let nsc = c.nof_subcarriers();

        for (delay, bound) in [(4.0, 0.01), (16.0, 0.06)] {
            let h = |k: usize| delayed_path(k, delay);
            let mut grid = downlink_grid(&c, 2);
            apply_channel(&mut grid, nsc, h);

            let mut errors = Vec::new();
            for alg in [EstimatorAlgorithm::Interpolate, EstimatorAlgorithm::Average] {
                let cfg = EstimatorConfig {
                    estimator_alg: alg,
                    filter_type: FilterType::None,
                    ..EstimatorConfig::default()
                };
                let mut est = ChannelEstimator::new(25, 1).unwrap();
                est.set_cell(&c).unwrap();
                let mut res = ChannelEstimateResult::new(25, 1);
                est.estimate(&SubframeConfig::new(2), &cfg, &mut [grid.clone()], &mut res)
                    .unwrap();
                let worst = (0..ports as usize)
                    .map(|p| max_error(&res.ce[p][0][..c.nof_re()], nsc, 6, h))
                    .fold(0.0, f32::max);
                errors.push(worst);
            }

            let (interpolate, average) = (errors[0], errors[1]);
            assert!(
                average < bound && average <= interpolate,
                "cell {} delay {}: average {} interpolate {}",
                id,
                delay,
                average,
                interpolate
            );
        }
    }
}

#[test]
fn test_smoothing_reduces_noise() {
    init_tracing();
    let c = cell(5, 25, CyclicPrefix::Normal, 1);
    let nsc = c.nof_subcarriers();
    let h = |k: usize| delayed_path(k, 1.0);
    let mut grid = downlink_grid(&c, 3);
    apply_channel(&mut grid, nsc, h);
    add_awgn(&mut grid, 0.01, 17);

    let mse = |filter_type: FilterType, filter_coef: [f32; 2]| {
        let cfg = EstimatorConfig {
            filter_type,
            filter_coef,
            ..EstimatorConfig::default()
        };
        let mut est = ChannelEstimator::new(25, 1).unwrap();
        est.set_cell(&c).unwrap();
        let mut res = ChannelEstimateResult::new(25, 1);
        est.estimate(&SubframeConfig::new(3), &cfg, &mut [grid.clone()], &mut res)
            .unwrap();
        mean_sq_error(&res.ce[0][0][..c.nof_re()], nsc, h)
    };

    let raw = mse(FilterType::None, [0.0, 0.0]);
    let gauss = mse(FilterType::Gauss, [4.0, 100.0]);
    let triangle = mse(FilterType::Triangle, [5.0, 0.0]);
    assert!(gauss < 0.8 * raw, "gauss {} raw {}", gauss, raw);
    assert!(triangle < 0.8 * raw, "triangle {} raw {}", triangle, raw);
}

#[test]
fn test_mbsfn_with_noise() {
    init_tracing();
    let c = cell(12, 15, CyclicPrefix::Normal, 1);
    let nsc = c.nof_subcarriers();
    let variance = 0.01;
    let set = MbsfnSignalSet::generate(3, 15).unwrap();
    let mut grid = vec![Complex32::new(0.0, 0.0); c.nof_re()];
    set.put_sf(2, &mut grid);
    add_awgn(&mut grid, variance, 23);

    let cfg = EstimatorConfig {
        mbsfn_area_id: Some(3),
        ..EstimatorConfig::default()
    };
    let mut est = ChannelEstimator::new(15, 1).unwrap();
    est.set_cell(&c).unwrap();
    let mut res = ChannelEstimateResult::new(15, 1);
    est.estimate(&SubframeConfig::mbsfn(2), &cfg, &mut [grid], &mut res)
        .unwrap();

    let mbsfn_re = MBSFN_SYMBOLS_PER_SUBFRAME * nsc;
    let err = mean_sq_error(&res.ce[0][0][..mbsfn_re], nsc, |_| Complex32::new(1.0, 0.0));
    assert!(err < variance, "estimate error {}", err);
    let ratio = res.noise_estimate / variance;
    assert!(ratio > 0.5 && ratio < 2.0, "noise ratio {}", ratio);
    assert!((power_to_db(res.rsrp)).abs() < 0.5);
}
