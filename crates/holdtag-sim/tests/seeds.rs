use holdtag_sim::{ActionMix, SimulationConfig, Simulator};
use proptest::prelude::*;

fn run(config: SimulationConfig) -> holdtag_sim::SimulationResult {
    Simulator::new(config).expect("simulator").run().expect("run")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn any_seed_agrees_with_model(seed in any::<u64>(), stations in 1_usize..4) {
        let result = run(SimulationConfig {
            seed,
            stations,
            steps: 40,
            ..SimulationConfig::default()
        });
        prop_assert!(
            result.passed(),
            "discrepancies: {:?} final: {:?}",
            result.discrepancies,
            result.final_mismatches
        );
    }
}

#[test]
fn scan_heavy_mix_with_few_tags_stays_consistent() {
    let result = run(SimulationConfig {
        seed: 42,
        stations: 4,
        steps: 200,
        tag_slots: 3,
        label_slots: 5,
        stray_tag_percent: 0,
        mix: ActionMix {
            create_tag: 2,
            register_label: 2,
            scan: 12,
            force_rebind: 6,
            unbind: 1,
            dispose: 2,
            close: 1,
        },
    });
    assert!(result.passed(), "{:?} {:?}", result.discrepancies, result.final_mismatches);
    assert!(result.successes() > 0);
}
