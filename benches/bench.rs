// Copyright 2025 CloudWeGo Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{thread, time::Instant};

use chainbuf::{
    BlockBuffer, BufRead, BufWrite, NotifyMode, SpscBlockBuffer, SpscQueue, WaitMode,
};
use criterion::{Criterion, criterion_group, criterion_main};

fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("chainbuf");

    let sizes = [64usize, 512, 4096, 16 << 10, 64 << 10, 1 << 20];
    for size in sizes {
        group.bench_function(format!("block_buffer_round_trip_{}b", size), |b| {
            b.iter_custom(|iters| {
                let data = vec![0xa5u8; size];
                let start = Instant::now();
                for _ in 0..iters {
                    let mut buf = BlockBuffer::new();
                    let block = buf.block_size();
                    buf.write(&data);
                    let mut read = 0;
                    while read < size {
                        let in_block = block - read % block;
                        let want = usize::min(in_block, size - read);
                        read += buf.read_cont(want).unwrap().len();
                    }
                }
                start.elapsed()
            })
        });
    }

    group.bench_function("spsc_queue_push_pop", |b| {
        b.iter_custom(|iters| {
            let (mut tx, mut rx) = SpscQueue::split::<u64>(WaitMode::WaitFree);
            let start = Instant::now();
            for i in 0..iters {
                tx.push(i);
                rx.pop();
            }
            start.elapsed()
        })
    });

    group.bench_function("spsc_block_buffer_spin_u64_handoff", |b| {
        b.iter_custom(|iters| {
            let (mut writer, mut reader) = SpscBlockBuffer::new(NotifyMode::Spin).unwrap();
            let start = Instant::now();
            let producer = thread::spawn(move || {
                for i in 0..iters {
                    writer.write_value(&i);
                }
            });
            for n in 0..iters {
                reader.read_value::<u64>().unwrap();
                if n % 256 == 0 {
                    reader.clear_preserved(16 << 10);
                }
            }
            producer.join().unwrap();
            start.elapsed()
        })
    });

    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
