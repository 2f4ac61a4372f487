//! Runs a producer and a consumer against a software vsync, the way a
//! compositor would drive a single layer.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use flingr::buffer::{BufferItem, GraphicBuffer};
use flingr::consumer::{
    BufferLayerConsumer, ConsumerConfig, RenderBackend, UpdateOutcome, UpdateRequest,
};
use flingr::event::{
    ChannelTransport, DisplayEvent, DistributorConfig, EventDistributor, SoftwareVsyncSource,
};
use flingr::sync::Fence;
use flingr::{PixelFormat, Rect};
use flingr_utils::fake_queue::{FakeBufferQueue, QueueError};
use flingr_utils::fence_timeline::FenceTimeline;

use anyhow::ensure;
use clap::{Arg, Command};
use log::{debug, info, warn};

/// Pretends to sample buffers, checking their fences have signaled.
struct LoggingBackend {
    implicit_sync: bool,
    num_binds: AtomicUsize,
}

impl RenderBackend for LoggingBackend {
    fn bind_external_buffer(
        &self,
        texture: u32,
        buffer: Option<&Arc<GraphicBuffer>>,
        fence: &Fence,
    ) -> anyhow::Result<()> {
        let signaled = fence.wait(Some(Duration::from_millis(100)))?;
        ensure!(signaled, "acquire fence did not signal in time");

        if let Some(buffer) = buffer {
            debug!(
                "Binding buffer {} ({}x{}) to texture {}",
                buffer.id(),
                buffer.width,
                buffer.height,
                texture
            );
        }
        self.num_binds.fetch_add(1, Ordering::Relaxed);

        Ok(())
    }

    fn uses_implicit_sync(&self) -> bool {
        self.implicit_sync
    }

    fn uses_wait_sync(&self) -> bool {
        false
    }

    fn wait_fence(&self, fence: &Fence) -> bool {
        fence.wait_forever().is_ok()
    }
}

fn parse_size(s: &str) -> (u32, u32) {
    const ERROR_MSG: &str = "Invalid parameter for frame_size";
    let split: Vec<&str> = s.split('x').collect();
    if split.len() != 2 {
        panic!("{}", ERROR_MSG);
    }
    let width: u32 = split[0].parse().expect(ERROR_MSG);
    let height: u32 = split[1].parse().expect(ERROR_MSG);

    (width, height)
}

fn main() {
    env_logger::init();

    let matches = Command::new("Frame pipeline")
        .arg(
            Arg::new("num_frames")
                .long("stop_after")
                .takes_value(true)
                .help("Stop after presenting a given number of frames"),
        )
        .arg(
            Arg::new("frame_size")
                .long("frame_size")
                .takes_value(true)
                .default_value("640x480")
                .help("Size of the frames to produce (e.g. \"640x480\")"),
        )
        .arg(
            Arg::new("period")
                .long("period")
                .takes_value(true)
                .default_value("16")
                .help("Vsync period in milliseconds"),
        )
        .arg(
            Arg::new("rate")
                .long("rate")
                .takes_value(true)
                .default_value("1")
                .help("Present on every given number of vsync events"),
        )
        .arg(
            Arg::new("resize_every")
                .long("resize_every")
                .takes_value(true)
                .default_value("0")
                .help("Swap the frame dimensions every given number of frames"),
        )
        .arg(
            Arg::new("explicit_sync")
                .long("explicit_sync")
                .help("Bind buffers at draw time and rely on release fences"),
        )
        .get_matches();

    let stop_after: Option<usize> = matches
        .value_of("num_frames")
        .map(|s| s.parse().expect("Invalid value for stop_after"));
    let (mut width, mut height) = matches
        .value_of("frame_size")
        .map(parse_size)
        .unwrap_or((640, 480));
    let period = matches
        .value_of("period")
        .map(|s| Duration::from_millis(s.parse().expect("Invalid value for period")))
        .unwrap_or(Duration::from_millis(16));
    let rate: u32 = matches
        .value_of("rate")
        .map(|s| s.parse().expect("Invalid value for rate"))
        .unwrap_or(1);
    let resize_every: u32 = matches
        .value_of("resize_every")
        .map(|s| s.parse().expect("Invalid value for resize_every"))
        .unwrap_or(0);
    let explicit_sync = matches.is_present("explicit_sync");

    let lets_quit = Arc::new(AtomicBool::new(false));
    // Setup the Ctrl+c handler.
    {
        let lets_quit_handler = lets_quit.clone();
        ctrlc::set_handler(move || {
            lets_quit_handler.store(true, Ordering::SeqCst);
        })
        .expect("Failed to set Ctrl-C handler.");
    }

    let vsync_source = Arc::new(SoftwareVsyncSource::new(period).expect("Failed to start vsync"));
    let distributor = EventDistributor::new(
        vsync_source,
        DistributorConfig::new("events").software_vsync_period(period),
    )
    .expect("Failed to start event distributor");
    let (transport, events) = ChannelTransport::new(4);
    let connection = distributor.create_connection(Box::new(transport));
    connection
        .set_vsync_rate(rate.max(1))
        .expect("Failed to request vsync events");

    let queue = FakeBufferQueue::new(3);
    let backend = Arc::new(LoggingBackend {
        implicit_sync: !explicit_sync,
        num_binds: AtomicUsize::new(0),
    });
    let consumer = BufferLayerConsumer::new(
        queue.consumer(),
        Arc::clone(&backend) as Arc<dyn RenderBackend>,
        ConsumerConfig::new("layer")
            .texture_name(1)
            .default_size(width, height),
    )
    .expect("Failed to create consumer");

    let mut render_timeline = FenceTimeline::new("render");
    let mut display_timeline = FenceTimeline::new("display");
    let mut frame_counter = 0usize;
    let mut num_produced = 0u64;
    let start = Instant::now();

    while !lets_quit.load(Ordering::SeqCst) {
        if let Some(stop_after) = stop_after {
            if frame_counter >= stop_after {
                break;
            }
        }

        let timestamp = match events.recv_timeout(Duration::from_secs(1)) {
            Ok(DisplayEvent::Vsync { timestamp, .. }) => timestamp,
            Ok(event) => {
                info!("Received {:?}", event);
                continue;
            }
            Err(e) => {
                warn!("No vsync received: {}", e);
                continue;
            }
        };

        // The previous frame has been scanned out.
        display_timeline
            .advance(1)
            .expect("Failed to signal display fence");

        if resize_every > 0 && num_produced > 0 && num_produced % resize_every as u64 == 0 {
            std::mem::swap(&mut width, &mut height);
            info!("Resizing to {}x{}", width, height);
            consumer
                .set_default_buffer_size(width, height)
                .expect("Failed to resize");
        }

        // Producer side.
        match queue.dequeue_buffer(0, 0, PixelFormat::RGBA_8888) {
            Ok(dequeued) => {
                if dequeued.reallocated {
                    consumer.on_slot_freed(dequeued.slot);
                }
                dequeued
                    .fence
                    .wait_forever()
                    .expect("Failed to wait for release fence");

                num_produced += 1;
                let fence = render_timeline
                    .create_fence(num_produced)
                    .expect("Failed to create render fence");
                queue
                    .queue_buffer(
                        dequeued.slot,
                        BufferItem {
                            fence,
                            crop: Rect::from_size(width, height),
                            timestamp,
                            ..Default::default()
                        },
                    )
                    .expect("Failed to queue buffer");
                render_timeline
                    .advance(1)
                    .expect("Failed to signal render fence");
            }
            Err(QueueError::NoFreeSlot) => warn!("Producer is starved"),
            Err(e) => panic!("Failed to dequeue buffer: {}", e),
        }

        // Consumer side.
        match consumer.update_current_buffer(UpdateRequest::new().expected_present_time(timestamp)) {
            Ok(UpdateOutcome::Updated(_)) => (),
            Ok(outcome) => {
                debug!("Nothing to present: {:?}", outcome);
                continue;
            }
            Err(e) => panic!("Failed to update buffer: {}", e),
        }
        if explicit_sync {
            consumer
                .bind_current_buffer()
                .expect("Failed to bind buffer");
            consumer.do_fence_wait().expect("Failed to wait for buffer");
        }
        consumer.release_freed_image();

        let release_fence = display_timeline
            .create_fence(display_timeline.value() + 1)
            .expect("Failed to create display fence");
        consumer.set_release_fence(&release_fence);

        frame_counter += 1;
        let fps = frame_counter as f32 / start.elapsed().as_millis() as f32 * 1000.0;
        print!(
            "\rPresented frame {:4} (slot {:?}, {:.2} fps)",
            consumer.frame_number(),
            consumer.current_slot(),
            fps
        );
        std::io::Write::flush(&mut std::io::stdout()).ok();
    }
    println!();

    print!("{}", consumer.dump(""));
    print!("{}", distributor.dump());
    println!(
        "{} binds, {} slots held",
        backend.num_binds.load(Ordering::Relaxed),
        consumer.slot_stats().num_held()
    );
}
