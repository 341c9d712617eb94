//! Buffer Loader & Resource Loader Tests
//!
//! Tests for:
//! - Buffer creation, validation and memory-domain resolution
//! - Initial uploads (host-visible write vs. chunked staging)
//! - Live updates (mapped, inline command, staged)
//! - ResourceLoader load/unload bookkeeping and cleanup
//! - LoadRequest inline and asynchronous batches

use std::path::PathBuf;
use std::sync::Arc;

use myth_loader::assets::BufferAssetHandle;
use myth_loader::gpu::{BufferCreateInfo, BufferUsage, GpuDevice, HeadlessDevice, MemoryDomain, TransferCommand};
use myth_loader::resources::{
    BufferContentType, BufferLoadInfo, BufferLoader, BufferRange, BufferUpdateInfo, LIMIT_BUFFER_CMD_UPDATE_SIZE,
    ResourceLoader, ResourceLoaderCreateInfo,
};
use myth_loader::LoaderError;

// ============================================================================
// Helpers
// ============================================================================

fn temp_dir(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("myth-loader-{tag}-{}", uuid::Uuid::new_v4()))
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn device() -> (Arc<HeadlessDevice>, Arc<dyn GpuDevice>) {
    init_logging();
    let device = Arc::new(HeadlessDevice::default());
    let dyn_device: Arc<dyn GpuDevice> = device.clone();
    (device, dyn_device)
}

fn loader(device: Arc<dyn GpuDevice>, async_loading: bool) -> ResourceLoader {
    ResourceLoader::new(
        device,
        ResourceLoaderCreateInfo {
            async_loading,
            worker_threads: 2,
            shader_cache_dir: temp_dir("buffers"),
            ..Default::default()
        },
    )
    .expect("loader")
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn raw_info(name: &str, data: Option<Vec<u8>>, size: u64, usage: BufferUsage, domain: MemoryDomain) -> BufferLoadInfo {
    BufferLoadInfo {
        debug_name: name.into(),
        data,
        create_info: BufferCreateInfo { size, usage, domain },
        content_type: BufferContentType::RawData,
        force_uncached: false,
    }
}

// ============================================================================
// BufferLoader::load
// ============================================================================

#[test]
fn oversized_data_is_rejected_before_creation() {
    let (headless, device) = device();
    let info = raw_info("too_big", Some(vec![0; 2048]), 1024, BufferUsage::STORAGE, MemoryDomain::Device);

    let result = BufferLoader::load(&device, &info, 1 << 20);
    assert!(matches!(result, Err(LoaderError::Runtime(_))));
    assert_eq!(headless.live_buffer_count(), 0);
}

#[test]
fn zero_size_is_rejected() {
    let (headless, device) = device();
    let info = raw_info("empty", None, 0, BufferUsage::VERTEX, MemoryDomain::Device);
    assert!(BufferLoader::load(&device, &info, 1024).is_err());
    assert_eq!(headless.live_buffer_count(), 0);
}

#[test]
fn device_local_upload_is_chunked() {
    let (headless, device) = device();
    let data = pattern(10_000);
    let info = raw_info("staged", Some(data.clone()), 10_000, BufferUsage::VERTEX, MemoryDomain::Device);

    let asset = BufferLoader::load(&device, &info, 4096).expect("load");
    assert_eq!(headless.buffer_data(asset.handle()), Some(data));
    // 4096 + 4096 + 1808
    assert_eq!(headless.submit_count(), 3);
    // Staging buffers are gone; only the destination remains.
    assert_eq!(headless.live_buffer_count(), 1);
    assert!(asset.usage().contains(BufferUsage::TRANSFER_DST));
}

#[test]
fn host_visible_upload_writes_directly() {
    let (headless, device) = device();
    let data = pattern(256);
    let info = raw_info("host", Some(data.clone()), 512, BufferUsage::UNIFORM, MemoryDomain::Host);

    let asset = BufferLoader::load(&device, &info, 4096).expect("load");
    let contents = headless.buffer_data(asset.handle()).expect("buffer");
    assert_eq!(&contents[..256], data.as_slice());
    assert!(contents[256..].iter().all(|&b| b == 0));
    assert_eq!(headless.submit_count(), 0);
    assert!(!headless.is_mapped(asset.handle()));
}

#[test]
fn auto_domain_resolves_from_usage() {
    let (_headless, device) = device();
    let uniform = BufferLoader::load(
        &device,
        &raw_info("u", None, 64, BufferUsage::UNIFORM, MemoryDomain::Auto),
        1024,
    )
    .expect("uniform");
    assert_eq!(uniform.domain(), MemoryDomain::Host);

    let vertex = BufferLoader::load(
        &device,
        &raw_info("v", None, 64, BufferUsage::VERTEX, MemoryDomain::Auto),
        1024,
    )
    .expect("vertex");
    assert_eq!(vertex.domain(), MemoryDomain::Device);
}

#[test]
fn from_slice_sizes_buffer_to_data() {
    let info = BufferLoadInfo::from_slice("indices", &[0u32, 1, 2], BufferUsage::INDEX, BufferContentType::Index);
    assert_eq!(info.create_info.size, 12);
    assert_eq!(info.data_size(), 12);
}

#[test]
fn info_string_describes_buffer() {
    let (_headless, device) = device();
    let info = BufferLoadInfo::from_slice("positions", &[1.0f32; 6], BufferUsage::VERTEX, BufferContentType::Vertex);
    let asset = BufferLoader::load(&device, &info, 1024).expect("load");

    let text = asset.info_string();
    assert!(text.contains("Buffer: positions"));
    assert!(text.contains("Size: 24 bytes"));
    assert!(text.contains("Content Type: Vertex Data"));
    assert!(asset.load_timestamp() > 0);
}

// ============================================================================
// BufferLoader::update
// ============================================================================

#[test]
fn update_host_visible_through_mapping() {
    let (headless, device) = device();
    let asset = BufferLoader::load(
        &device,
        &raw_info("host", None, 64, BufferUsage::STORAGE, MemoryDomain::Host),
        1024,
    )
    .expect("load");

    BufferLoader::update(&asset, &BufferUpdateInfo::new(&[7; 8], 16), 1024).expect("update");
    let contents = headless.buffer_data(asset.handle()).expect("buffer");
    assert_eq!(&contents[16..24], &[7; 8]);
    assert_eq!(headless.submit_count(), 0);
    assert!(!asset.is_mapped());
}

#[test]
fn update_keeps_caller_mapping() -> anyhow::Result<()> {
    let (headless, device) = device();
    let asset = BufferLoader::load(
        &device,
        &raw_info("persistent", None, 64, BufferUsage::UNIFORM, MemoryDomain::Host),
        1024,
    )?;

    asset.map()?;
    BufferLoader::update(&asset, &BufferUpdateInfo::new(&[3; 4], 0), 1024)?;
    assert!(asset.is_mapped());
    assert!(headless.is_mapped(asset.handle()));

    // The caller's mapping is still usable after the update.
    asset.write_mapped(8, &[9; 4])?;
    let contents = headless.buffer_data(asset.handle()).expect("buffer");
    assert_eq!(&contents[0..4], &[3; 4]);
    assert_eq!(&contents[8..12], &[9; 4]);

    asset.unmap();
    assert!(!headless.is_mapped(asset.handle()));
    Ok(())
}

#[test]
fn small_device_update_is_recorded_inline() {
    let (headless, device) = device();
    let asset = BufferLoader::load(
        &device,
        &raw_info("dev", None, 1024, BufferUsage::VERTEX, MemoryDomain::Device),
        1 << 20,
    )
    .expect("load");

    BufferLoader::update(&asset, &BufferUpdateInfo::new(&[3; 32], 100), 1 << 20).expect("update");
    assert_eq!(
        headless.submitted_commands(),
        vec![TransferCommand::UpdateBuffer {
            dst: asset.handle(),
            dst_offset: 100,
            data: vec![3; 32],
        }]
    );
}

#[test]
fn large_device_update_is_staged() {
    let (headless, device) = device();
    let size = LIMIT_BUFFER_CMD_UPDATE_SIZE * 2;
    let asset = BufferLoader::load(
        &device,
        &raw_info("big", None, size, BufferUsage::STORAGE, MemoryDomain::Device),
        1 << 20,
    )
    .expect("load");

    let data = pattern(size as usize);
    BufferLoader::update(&asset, &BufferUpdateInfo::new(&data, 0), LIMIT_BUFFER_CMD_UPDATE_SIZE).expect("update");

    let commands = headless.submitted_commands();
    assert_eq!(commands.len(), 2);
    assert!(commands.iter().all(|c| matches!(c, TransferCommand::CopyBuffer { .. })));
    assert_eq!(headless.buffer_data(asset.handle()), Some(data));
}

#[test]
fn whole_size_update_covers_rest_of_buffer() {
    let (headless, device) = device();
    let asset = BufferLoader::load(
        &device,
        &raw_info("rest", None, 16, BufferUsage::UNIFORM, MemoryDomain::Host),
        1024,
    )
    .expect("load");

    let update = BufferUpdateInfo {
        data: &[9; 12],
        range: BufferRange { offset: 4, ..Default::default() },
    };
    BufferLoader::update(&asset, &update, 1024).expect("update");
    let contents = headless.buffer_data(asset.handle()).expect("buffer");
    assert_eq!(&contents[..4], &[0; 4]);
    assert_eq!(&contents[4..], &[9; 12]);
}

#[test]
fn update_out_of_range_fails() {
    let (_headless, device) = device();
    let asset = BufferLoader::load(
        &device,
        &raw_info("small", None, 16, BufferUsage::UNIFORM, MemoryDomain::Host),
        1024,
    )
    .expect("load");

    assert!(BufferLoader::update(&asset, &BufferUpdateInfo::new(&[0; 8], 12), 1024).is_err());
    assert!(BufferLoader::update(&asset, &BufferUpdateInfo::new(&[0; 4], 20), 1024).is_err());

    let short = BufferUpdateInfo {
        data: &[0; 2],
        range: BufferRange { offset: 0, size: 8 },
    };
    assert!(BufferLoader::update(&asset, &short, 1024).is_err());
}

// ============================================================================
// ResourceLoader
// ============================================================================

#[test]
fn load_then_unload_releases_buffer() {
    let (headless, device) = device();
    let loader = loader(device, false);

    let handle = loader
        .load(BufferLoadInfo::from_slice("a", &[1u8; 64], BufferUsage::VERTEX, BufferContentType::Vertex))
        .expect("load");
    assert_eq!(loader.tracked_count(), 1);
    assert!(loader.buffer(handle).is_some());
    assert_eq!(headless.live_buffer_count(), 1);

    loader.unload(handle);
    assert_eq!(loader.tracked_count(), 0);
    assert!(loader.buffer(handle).is_none());
    assert_eq!(headless.live_buffer_count(), 0);
}

#[test]
#[should_panic(expected = "untracked asset handle")]
fn double_unload_panics() {
    let (_headless, device) = device();
    let loader = loader(device, false);
    let handle = loader
        .load(BufferLoadInfo::from_slice("a", &[1u8; 4], BufferUsage::VERTEX, BufferContentType::Vertex))
        .expect("load");
    loader.unload(handle);
    loader.unload(handle);
}

#[test]
#[should_panic(expected = "untracked asset handle")]
fn unload_of_foreign_handle_panics() {
    let (_headless, device) = device();
    let loader = loader(device, false);
    loader.unload(BufferAssetHandle::default());
}

#[test]
fn failed_load_registers_nothing() {
    let (headless, device) = device();
    let loader = loader(device, false);
    let info = raw_info("bad", Some(vec![0; 32]), 16, BufferUsage::VERTEX, MemoryDomain::Device);
    assert!(loader.load(info).is_err());
    assert_eq!(loader.tracked_count(), 0);
    assert_eq!(headless.live_buffer_count(), 0);
}

#[test]
fn update_through_loader() {
    let (headless, device) = device();
    let loader = loader(device, false);
    let handle = loader
        .load(raw_info("u", None, 32, BufferUsage::UNIFORM, MemoryDomain::Host))
        .expect("load");

    loader.update(&BufferUpdateInfo::new(&[5; 4], 0), handle).expect("update");
    let asset = loader.buffer(handle).expect("asset");
    assert_eq!(&headless.buffer_data(asset.handle()).expect("data")[..4], &[5; 4]);

    loader.unload(handle);
    assert!(matches!(
        loader.update(&BufferUpdateInfo::new(&[5; 4], 0), handle),
        Err(LoaderError::AssetNotFound(_))
    ));
}

#[test]
fn cleanup_releases_everything() {
    let (headless, device) = device();
    let loader = loader(device, false);
    for i in 0..4u8 {
        loader
            .load(BufferLoadInfo::from_slice(format!("b{i}"), &[i; 16], BufferUsage::VERTEX, BufferContentType::Vertex))
            .expect("load");
    }
    assert_eq!(headless.live_buffer_count(), 4);

    loader.cleanup();
    assert_eq!(loader.tracked_count(), 0);
    assert_eq!(headless.live_resource_count(), 0);
}

// ============================================================================
// LoadRequest
// ============================================================================

#[test]
fn load_request_inline() {
    let (headless, device) = device();
    let loader = loader(device, true);

    let mut request = loader.create_request();
    let a = request.add(BufferLoadInfo::from_slice("a", &[1u8; 8], BufferUsage::VERTEX, BufferContentType::Vertex));
    let b = request.add(BufferLoadInfo::from_slice("b", &[2u8; 8], BufferUsage::INDEX, BufferContentType::Index));
    assert_eq!(request.len(), 2);
    assert!(!a.is_loaded());

    request.load().expect("batch");
    assert!(a.is_loaded() && b.is_loaded());
    assert_eq!(headless.live_buffer_count(), 2);
    assert_ne!(a.get(), b.get());
}

#[test]
fn load_request_async_on_pool() {
    let (headless, device) = device();
    let loader = loader(device, true);
    assert!(loader.is_async());

    let mut request = loader.create_request();
    let slots: Vec<_> = (0..16u8)
        .map(|i| request.add(BufferLoadInfo::from_slice(format!("b{i}"), &[i; 32], BufferUsage::STORAGE, BufferContentType::Storage)))
        .collect();

    request.load_async().wait().expect("batch");
    assert!(slots.iter().all(|s| s.is_loaded()));
    assert_eq!(loader.tracked_count(), 16);
    assert_eq!(headless.live_buffer_count(), 16);

    for slot in &slots {
        let asset = loader.buffer(slot.get().expect("handle")).expect("asset");
        assert_eq!(asset.size(), 32);
    }
    loader.cleanup();
}

#[test]
fn load_request_async_disabled_runs_immediately() {
    let (_headless, device) = device();
    let loader = loader(device, false);

    let mut request = loader.create_request();
    let slot = request.add(BufferLoadInfo::from_slice("now", &[0u8; 4], BufferUsage::VERTEX, BufferContentType::Vertex));
    let future = request.load_async();
    // Already done before anyone waits.
    assert!(slot.is_loaded());
    future.wait().expect("batch");
}

#[test]
fn load_request_reports_first_failure() {
    let (_headless, device) = device();
    let loader = loader(device, true);

    let mut request = loader.create_request();
    let _good = request.add(BufferLoadInfo::from_slice("ok", &[0u8; 4], BufferUsage::VERTEX, BufferContentType::Vertex));
    let bad = request.add(raw_info("bad", Some(vec![0; 8]), 4, BufferUsage::VERTEX, MemoryDomain::Device));

    assert!(request.load_async().wait().is_err());
    assert!(!bad.is_loaded());
    loader.cleanup();
}

#[test]
fn empty_request_completes() {
    let (_headless, device) = device();
    let loader = loader(device, true);
    let request = loader.create_request();
    assert!(request.is_empty());
    request.load_async().wait().expect("empty batch");
}
