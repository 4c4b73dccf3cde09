//! E2E tests: emulator → decoder → per-channel tables
//!
//! Packets come from the seeded emulator (or the record builders for
//! hand-made anomalies), are decoded through the registry and checked row by
//! row against what was generated.

use std::collections::BTreeMap;

use orca_digitizers::common::DecodeError;
use orca_digitizers::config::{CardInfo, ObjectInfo};
use orca_digitizers::data_source_emulator::{
    presum, Emulator, EmulatorConfig, Gretina4mRecord, Model, PulseConfig, Sis3302Record,
    Sis3316Record,
};
use orca_digitizers::decoder::multisampling::{find_splice, RAW_LEN, WF_SKIP};
use orca_digitizers::decoder::{
    ChannelKey, DecodeResult, DecoderRegistry, MultisamplingParams, OrcaDecoder, PacketView,
    Sis3302Decoder, TableSet, WAVEFORM,
};
use orca_digitizers::table::{OutputTable, Table};
use rand::prelude::*;
use rand::rngs::StdRng;

/// Decoder for `config.model`, configured from the emulator's object info
fn decoder_for(emulator: &Emulator) -> Box<dyn OrcaDecoder> {
    let id = emulator.config().model.decoder_id();
    let mut decoder = DecoderRegistry::new()
        .create(id.decoder_name, id.orca_class_name)
        .expect("registered decoder");
    decoder
        .set_object_info(&emulator.object_info())
        .expect("valid object info");
    decoder
}

/// One table per built schema
fn tables_for(decoder: &dyn OrcaDecoder) -> BTreeMap<ChannelKey, Table> {
    decoder
        .schemas()
        .iter()
        .map(|(key, schema)| (*key, Table::new(schema)))
        .collect()
}

/// Generate `n` packets and decode them all into `tables`
fn run(
    emulator: Emulator,
    decoder: &mut dyn OrcaDecoder,
    tables: &mut BTreeMap<ChannelKey, Table>,
    n: usize,
) -> Vec<DecodeResult> {
    emulator
        .take(n)
        .enumerate()
        .map(|(i, packet)| {
            decoder
                .decode_packet(
                    &PacketView::new(&packet),
                    &mut TableSet::PerChannel(tables),
                    i as u32,
                    None,
                )
                .unwrap_or_else(|e| panic!("packet {} failed: {}", i, e))
        })
        .collect()
}

/// Every `ievt` value across all tables, sorted
fn all_ievt(tables: &BTreeMap<ChannelKey, Table>) -> Vec<u64> {
    let mut ievt: Vec<u64> = tables
        .values()
        .flat_map(|t| (0..t.len()).map(move |row| t.scalar("ievt", row).unwrap()))
        .collect();
    ievt.sort_unstable();
    ievt
}

#[test]
fn test_one_row_per_packet_every_model() {
    let cases = [
        EmulatorConfig {
            model: Model::Sis3302,
            seed: 1,
            wrap_probability: 0.5,
            ..Default::default()
        },
        EmulatorConfig {
            model: Model::Gretina4m,
            seed: 2,
            ..Default::default()
        },
        EmulatorConfig {
            model: Model::Sis3316,
            seed: 3,
            trace_length: 500,
            ..Default::default()
        },
        EmulatorConfig {
            model: Model::Ami286,
            n_channels: 1,
            seed: 4,
            ..Default::default()
        },
    ];
    let n = 200;

    for config in cases {
        let model = config.model;
        let emulator = Emulator::new(config).unwrap();
        let mut decoder = decoder_for(&emulator);
        let mut tables = tables_for(decoder.as_ref());
        let results = run(emulator, decoder.as_mut(), &mut tables, n);

        assert!(
            results.iter().all(|r| *r == DecodeResult::Written),
            "{:?}: unexpected skip",
            model
        );
        let rows: usize = tables.values().map(|t| t.len()).sum();
        assert_eq!(rows, n, "{:?}", model);
        assert_eq!(decoder.events_decoded(), n as u32);
        assert_eq!(all_ievt(&tables), (0..n as u64).collect::<Vec<_>>());
        assert!(decoder.skipped_channels().is_empty());
    }
}

#[test]
fn test_rows_land_in_their_channel_table() {
    let emulator = Emulator::new(EmulatorConfig {
        model: Model::Sis3316,
        card: 7,
        crate_id: 2,
        seed: 11,
        trace_length: 256,
        ..Default::default()
    })
    .unwrap();
    let mut decoder = decoder_for(&emulator);
    let mut tables = tables_for(decoder.as_ref());
    run(emulator, decoder.as_mut(), &mut tables, 100);

    for (key, table) in &tables {
        for row in 0..table.len() {
            assert_eq!(table.scalar("crate", row), Some(key.crate_id() as u64));
            assert_eq!(table.scalar("card", row), Some(key.card() as u64));
            assert_eq!(table.scalar("channel", row), Some(key.channel() as u64));
        }
        // packet ids and timestamps only grow within a channel
        for row in 1..table.len() {
            assert!(table.scalar("packet_id", row) > table.scalar("packet_id", row - 1));
            assert!(table.scalar("timestamp", row) > table.scalar("timestamp", row - 1));
        }
    }
}

#[test]
fn test_missing_tables_are_counted_as_skips() {
    let emulator = Emulator::new(EmulatorConfig {
        model: Model::Sis3302,
        n_channels: 4,
        seed: 5,
        ..Default::default()
    })
    .unwrap();
    let mut decoder = decoder_for(&emulator);
    let kept = ChannelKey::resolve(0, 1, 0);
    let mut tables = tables_for(decoder.as_ref());
    tables.retain(|key, _| *key == kept);

    let n = 300;
    let results = run(emulator, decoder.as_mut(), &mut tables, n);

    let skipped = decoder.skipped_channels();
    let n_skipped = results
        .iter()
        .filter(|r| matches!(r, DecodeResult::Skipped(_)))
        .count();
    assert_eq!(skipped.total(), n_skipped as u64);
    assert_eq!(tables[&kept].len() + n_skipped, n);
    assert_eq!(skipped.get(kept), 0);
    for ch in 1..4 {
        assert!(skipped.get(ChannelKey::resolve(0, 1, ch)) > 0);
    }
    // skipped packets do not consume event numbers
    assert_eq!(decoder.events_decoded() as usize, tables[&kept].len());
}

#[test]
fn test_sis3302_wrapped_buffer_restores_time_order() {
    let mut rng = StdRng::seed_from_u64(7);
    let info = ObjectInfo::new(vec![CardInfo {
        internal_trigger_enabled_mask: Some(0b1),
        external_trigger_enabled_mask: Some(0),
        sample_lengths: Some(vec![64; 5]),
        ..CardInfo::new(0, 3)
    }]);
    let mut decoder = Sis3302Decoder::with_defaults();
    decoder.set_object_info(&info).unwrap();
    let key = ChannelKey::resolve(0, 3, 0);
    let mut table = Table::new(decoder.get_decoded_values(Some(key)).unwrap());

    let mut expected = Vec::new();
    for i in 0..20 {
        let waveform: Vec<u16> = (0..64).map(|_| rng.gen_range(0..16384)).collect();
        let record = Sis3302Record {
            wrap_offset: Some(rng.gen_range(0..64)),
            timestamp: 1000 * i as u64,
            ..Sis3302Record::new(0, 3, 0, waveform.clone())
        };
        decoder
            .decode_packet(
                &PacketView::new(&record.encode()),
                &mut TableSet::Single(&mut table),
                i,
                None,
            )
            .unwrap();
        expected.push(waveform);
    }

    for (row, waveform) in expected.iter().enumerate() {
        assert_eq!(table.waveform_u16(WAVEFORM, row), Some(&waveform[..]));
        assert_eq!(table.scalar("timestamp", row), Some(1000 * row as u64));
    }
}

#[test]
fn test_sis3302_corrupt_sentinel_fails() {
    let emulator = Emulator::new(EmulatorConfig {
        n_channels: 1,
        seed: 9,
        ..Default::default()
    })
    .unwrap();
    let mut decoder = decoder_for(&emulator);
    let mut tables = tables_for(decoder.as_ref());

    let mut packet = Emulator::new(emulator.config().clone())
        .unwrap()
        .next_packet();
    let n = packet.len();
    packet[n - 4..].copy_from_slice(&0x1234_5678u32.to_ne_bytes());

    let err = decoder
        .decode_packet(
            &PacketView::new(&packet),
            &mut TableSet::PerChannel(&mut tables),
            0,
            None,
        )
        .unwrap_err();
    assert!(matches!(
        err,
        DecodeError::FooterSentinel {
            found: 0x1234_5678,
            ..
        }
    ));
    assert!(err.is_geometry());
    assert!(tables.values().all(|t| t.is_empty()));
    assert_eq!(decoder.events_decoded(), 0);
}

#[test]
fn test_sis3316_short_trace_still_gives_row() {
    let mut decoder = DecoderRegistry::new()
        .create_by_class_name("ORSIS3316Model")
        .unwrap();
    let info = ObjectInfo::new(vec![CardInfo {
        raw_data_buffer_len: Some(100),
        ..CardInfo::new(1, 4)
    }]);
    decoder.set_object_info(&info).unwrap();
    let mut tables = tables_for(decoder.as_ref());

    let waveform: Vec<u16> = (0..60).map(|i| 500 + i).collect();
    let record = Sis3316Record {
        timestamp: 0x1_0000_0042,
        ..Sis3316Record::new(1, 4, 2, waveform.clone())
    };
    let result = decoder
        .decode_packet(
            &PacketView::new(&record.encode()),
            &mut TableSet::PerChannel(&mut tables),
            0,
            None,
        )
        .unwrap();
    assert_eq!(result, DecodeResult::Written);

    let table = &tables[&ChannelKey::resolve(1, 4, 2)];
    assert_eq!(table.len(), 1);
    assert_eq!(table.scalar("timestamp", 0), Some(0x1_0000_0042));
    let out = table.waveform_u16(WAVEFORM, 0).unwrap();
    assert_eq!(&out[..60], &waveform[..]);
    assert!(out[60..].iter().all(|&s| s == 0));
}

/// Raw Gretina4M samples of an encoded record
fn raw_samples(packet: &[u8]) -> Vec<i16> {
    PacketView::new(packet).i16_range(18, 18 + RAW_LEN).collect()
}

/// Check the reconstruction of one row against its raw record, which was
/// presummed from raw index `splice` on
fn assert_reconstruction(
    raw: &[i16],
    out: &[i16],
    params: &MultisamplingParams,
    splice: usize,
) {
    let ift = find_splice(raw, params);
    assert_eq!(ift, splice, "splice search missed the presum boundary");
    let ift_out = ift - WF_SKIP;
    assert_eq!(out.len(), params.output_len());
    assert_eq!(&out[..ift_out], &raw[WF_SKIP..ift]);

    // each complete window sums back to the coarse sample times the divider
    let rem_len = out.len() - ift_out;
    let n_windows = (rem_len / params.ps).min(raw.len() - ift);
    for j in 0..n_windows {
        let start = ift_out + j * params.ps;
        let sum: i64 = out[start..start + params.ps].iter().map(|&s| s as i64).sum();
        assert_eq!(
            sum,
            raw[ift + j] as i64 * params.div as i64,
            "window {} after splice {}",
            j,
            ift
        );
    }
}

/// Gretina4M decoder with only crate 0 card 5 channel 3 enabled, multisampled
fn multisampled_decoder(
    ft_len: usize,
    presum_index: usize,
    divider_index: usize,
) -> (Box<dyn OrcaDecoder>, Table) {
    let mut enabled = vec![false; 10];
    enabled[3] = true;
    let info = ObjectInfo::new(vec![CardInfo {
        enabled: Some(enabled),
        ft_cnt: Some(vec![ft_len as i64; 10]),
        mrpsrt: Some(vec![presum_index; 10]),
        mrpsdv: Some(vec![divider_index; 10]),
        ..CardInfo::new(0, 5)
    }]);
    let mut decoder = DecoderRegistry::new()
        .create_by_decoder_name("ORGretina4MWaveformDecoder")
        .unwrap();
    decoder.set_object_info(&info).unwrap();
    let table = Table::new(
        decoder
            .get_decoded_values(Some(ChannelKey::resolve(0, 5, 3)))
            .unwrap(),
    );
    (decoder, table)
}

#[test]
fn test_gretina4m_multisampling_window_sums() {
    let mut rng = StdRng::seed_from_u64(0xC0FFEE);
    let key = ChannelKey::resolve(0, 5, 3);
    let params = MultisamplingParams::from_registers(key, 200, 1, 1).unwrap();
    assert_eq!((params.ps, params.div), (4, 2));
    let (mut decoder, mut table) = multisampled_decoder(200, 1, 1);

    let mut records = Vec::new();
    for i in 0..25 {
        // random walk well above zero, presummed from a jittered splice point
        let splice = params.nominal_splice() + rng.gen_range(0..=WF_SKIP);
        let len = splice + (RAW_LEN - splice) * params.ps;
        let mut level = 2000i16;
        let full: Vec<i16> = (0..len)
            .map(|_| {
                level = (level + rng.gen_range(-20..=20)).clamp(1000, 3000);
                level
            })
            .collect();
        let packet = Gretina4mRecord::new(0, 5, 3, presum(&full, &params, splice)).encode();
        decoder
            .decode_packet(
                &PacketView::new(&packet),
                &mut TableSet::Single(&mut table),
                i,
                None,
            )
            .unwrap();
        records.push((raw_samples(&packet), splice));
    }

    for (row, (raw, splice)) in records.iter().enumerate() {
        let out = table.waveform_i16(WAVEFORM, row).unwrap();
        assert_reconstruction(raw, out, &params, *splice);
    }
}

#[test]
fn test_gretina4m_ramp_found_at_every_splice_shift() {
    let key = ChannelKey::resolve(0, 5, 3);
    let params = MultisamplingParams::from_registers(key, 200, 1, 1).unwrap();
    let (mut decoder, mut table) = multisampled_decoder(200, 1, 1);
    let full: Vec<i16> = (0..3000).map(|n| 1000 + 2 * n as i16).collect();

    for shift in 0..=WF_SKIP {
        let splice = params.nominal_splice() + shift;
        let packet = Gretina4mRecord::new(0, 5, 3, presum(&full, &params, splice)).encode();
        let raw = raw_samples(&packet);
        assert_eq!(find_splice(&raw, &params), splice, "shift {}", shift);

        decoder
            .decode_packet(
                &PacketView::new(&packet),
                &mut TableSet::Single(&mut table),
                shift as u32,
                None,
            )
            .unwrap();
        let out = table.waveform_i16(WAVEFORM, shift).unwrap();
        assert_reconstruction(&raw, out, &params, splice);
        // a ramp is linear inside every window, so it comes back exactly
        assert_eq!(out, &full[WF_SKIP..WF_SKIP + out.len()], "shift {}", shift);
    }
}

#[test]
fn test_gretina4m_emulated_stream_with_splice_jitter() {
    let mut emulator = Emulator::new(EmulatorConfig {
        model: Model::Gretina4m,
        n_channels: 2,
        seed: 21,
        ft_len: 300,
        presum_index: 2,
        divider_index: 2,
        splice_jitter: WF_SKIP,
        pulse: PulseConfig {
            amplitude_min: 200.0,
            amplitude_max: 1500.0,
            ..Default::default()
        },
        ..Default::default()
    })
    .unwrap();
    let mut decoder = decoder_for(&emulator);
    let mut tables = tables_for(decoder.as_ref());
    let params = MultisamplingParams::from_registers(ChannelKey::resolve(0, 1, 0), 300, 2, 2).unwrap();

    let mut rows: BTreeMap<ChannelKey, usize> = BTreeMap::new();
    for packet_id in 0..40 {
        let packet = emulator.next_packet();
        let splice = emulator.last_splice().unwrap();
        let result = decoder
            .decode_packet(
                &PacketView::new(&packet),
                &mut TableSet::PerChannel(&mut tables),
                packet_id,
                None,
            )
            .unwrap();
        let DecodeResult::Written = result else {
            panic!("packet {} skipped", packet_id);
        };

        let view = PacketView::new(&packet);
        let location = view.u16(1).unwrap();
        let key = ChannelKey::resolve(
            ((location >> 5) & 0xF) as u32,
            (location & 0x1F) as u32,
            (view.u16(4).unwrap() & 0xF) as u32,
        );
        let row = rows.entry(key).or_insert(0);
        let out = tables[&key].waveform_i16(WAVEFORM, *row).unwrap();
        assert_reconstruction(&raw_samples(&packet), out, &params, splice);
        *row += 1;
    }
}

#[test]
fn test_object_info_json_drives_registry_decoder() {
    let json = r#"[
        {"Crate": 0, "Card": 2, "Enabled": [1, 0, 1, 0, 0, 0, 0, 0, 0, 0],
         "FtCnt": [0, 0, 150, 0, 0, 0, 0, 0, 0, 0],
         "Mrpsrt": [0, 0, 3, 0, 0, 0, 0, 0, 0, 0],
         "Mrpsdv": [0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
         "Baseline Restore Enabled": [0, 0, 0, 0, 0, 0, 0, 0, 0, 0]}
    ]"#;
    let info = ObjectInfo::from_json(json).unwrap();
    let mut decoder = DecoderRegistry::new()
        .create("ORGretina4MWaveformDecoder", "ORGretina4MModel")
        .unwrap();
    decoder.set_object_info(&info).unwrap();

    let keys: Vec<ChannelKey> = decoder.schemas().keys().copied().collect();
    assert_eq!(
        keys,
        vec![ChannelKey::resolve(0, 2, 0), ChannelKey::resolve(0, 2, 2)]
    );
    let plain = decoder.get_decoded_values(Some(keys[0])).unwrap();
    assert_eq!(plain.waveform_length(), Some(2000));
    let multisampled = decoder.get_decoded_values(Some(keys[1])).unwrap();
    let params = MultisamplingParams::from_registers(keys[1], 150, 3, 0).unwrap();
    assert_eq!(multisampled.waveform_length(), Some(params.output_len()));

    // a plain channel copies packet words 32..2032
    let waveform: Vec<i16> = (0..RAW_LEN as i16).collect();
    let packet = Gretina4mRecord {
        energy: 0x1AB_CDEF,
        timestamp: 0x0000_1234_5678_9ABC,
        board_id: 0x2A,
        ..Gretina4mRecord::new(0, 2, 0, waveform.clone())
    }
    .encode();
    let mut tables = tables_for(decoder.as_ref());
    decoder
        .decode_packet(
            &PacketView::new(&packet),
            &mut TableSet::PerChannel(&mut tables),
            17,
            None,
        )
        .unwrap();
    let table = &tables[&keys[0]];
    assert_eq!(table.scalar("packet_id", 0), Some(17));
    assert_eq!(table.scalar("energy", 0), Some(0x1AB_CDEF));
    assert_eq!(table.scalar("timestamp", 0), Some(0x1234_5678_9ABC));
    assert_eq!(table.scalar("board_id", 0), Some(0x2A));
    assert_eq!(
        table.waveform_i16(WAVEFORM, 0).unwrap(),
        &waveform[14..2014]
    );
    assert_eq!(tables[&keys[1]].loc(), 0);
}
