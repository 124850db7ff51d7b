use std::collections::BTreeSet;

use criterion::{criterion_group, criterion_main, Criterion};
use gift_exchange_core::{generate_assignments, regenerate_partial, Assignment, ParticipantId};
use rand::rngs::StdRng;
use rand::SeedableRng;

// A shuffle of a large overlapping pool is fixed-point free only ~37% of the time.
const PARTIAL_ATTEMPTS: usize = 64;

fn mk_ids(prefix: &str, count: usize) -> Vec<ParticipantId> {
    (0..count).map(|index| ParticipantId::new(format!("{prefix}{index:04}"))).collect()
}

fn bench_full_draw(c: &mut Criterion) {
    let ids = mk_ids("p", 1_000);
    let mut rng = StdRng::seed_from_u64(0xBE7C);

    c.bench_function("full_draw_1000_participants", |b| {
        b.iter(|| {
            if let Err(err) = generate_assignments(&ids, &mut rng) {
                panic!("full draw benchmark failed: {err}");
            }
        });
    });
}

fn bench_partial_regeneration(c: &mut Criterion) {
    // Locked givers point at each other in a chain; the last one points into the unlocked pool.
    let locked = mk_ids("l", 100);
    let unlocked = mk_ids("u", 900);
    let mut locked_assignments = Assignment::new();
    for pair in locked.windows(2) {
        locked_assignments.insert(pair[0].clone(), pair[1].clone());
    }
    if let (Some(last), Some(first_unlocked)) = (locked.last(), unlocked.first()) {
        locked_assignments.insert(last.clone(), first_unlocked.clone());
    }
    let locked_ids = locked.into_iter().collect::<BTreeSet<_>>();
    let unlocked_ids = unlocked.into_iter().collect::<BTreeSet<_>>();
    let mut rng = StdRng::seed_from_u64(0x9A27);

    c.bench_function("partial_regeneration_100_locked_900_unlocked", |b| {
        b.iter(|| {
            let generated = regenerate_partial(
                &locked_assignments,
                &locked_ids,
                &unlocked_ids,
                &mut rng,
                PARTIAL_ATTEMPTS,
            );
            if let Err(err) = generated {
                panic!("partial regeneration benchmark failed: {err}");
            }
        });
    });
}

criterion_group!(derangement_benches, bench_full_draw, bench_partial_regeneration);
criterion_main!(derangement_benches);
