use anyhow::{Context, Result};
use ffmpeg_next as ffmpeg;
use image::codecs::jpeg::JpegEncoder;
use image::ColorType;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::SamplerConfig;
use crate::models::Frame;

/// 浏览器可播放的常见视频扩展名
const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "m4v", "mov", "webm", "mkv", "avi", "ogv", "ogg", "mpeg", "mpg", "3gp", "flv", "wmv", "ts",
];

/// seek 之后最多读取的视频数据包数量，避免在损坏文件上无限读取
const MAX_PACKETS_PER_SEEK: usize = 1500;

/// 解码时间戳与目标时间的容差（秒）
const SEEK_TOLERANCE: f64 = 0.02;

/// 按扩展名判断是否为视频文件
pub fn is_supported_video(path: impl AsRef<Path>) -> bool {
    path.as_ref()
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| VIDEO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// 计算采样时间点：0, i, 2i, ... 严格小于视频时长
pub fn sample_times(duration_secs: f64, interval_secs: u32) -> Vec<u32> {
    if !duration_secs.is_finite() || duration_secs <= 0.0 || interval_secs == 0 {
        return Vec::new();
    }
    (0u32..)
        .step_by(interval_secs as usize)
        .take_while(|t| f64::from(*t) < duration_secs)
        .collect()
}

/// 帧采样器：打开视频、读取时长，并按固定间隔抽取缩放后的 JPEG 帧
pub struct FrameSampler {
    input_path: PathBuf,
    config: SamplerConfig,
    duration: f64,
}

impl FrameSampler {
    pub fn open(input_path: impl AsRef<Path>, config: SamplerConfig) -> Result<Self> {
        ffmpeg::init().context("初始化 FFmpeg 失败")?;

        // 只输出 FFmpeg 自身的错误信息
        ffmpeg::util::log::set_level(ffmpeg::util::log::Level::Error);

        let input_path = input_path.as_ref().to_path_buf();
        let ictx = ffmpeg::format::input(&input_path)
            .with_context(|| format!("无法打开视频文件: {}", input_path.display()))?;

        let stream = ictx
            .streams()
            .best(ffmpeg::media::Type::Video)
            .context("未找到视频流")?;

        let duration = container_duration(&ictx).unwrap_or_else(|| {
            // 容器没有时长信息时退回视频流自身的时长
            let time_base = stream.time_base();
            let secs = pts_seconds(stream.duration(), time_base);
            if secs > 0.0 {
                secs
            } else {
                0.0
            }
        });

        Ok(Self {
            input_path,
            config,
            duration,
        })
    }

    /// 视频时长（秒）
    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn sample_times(&self) -> Vec<u32> {
        sample_times(self.duration, self.config.interval_secs)
    }

    /// 惰性帧序列，每次调用都会重新打开输入，从头开始采样
    pub fn frames(&self) -> Result<Frames> {
        let ictx = ffmpeg::format::input(&self.input_path)
            .with_context(|| format!("无法打开视频文件: {}", self.input_path.display()))?;

        let (stream_index, time_base, origin, parameters) = {
            let stream = ictx
                .streams()
                .best(ffmpeg::media::Type::Video)
                .context("未找到视频流")?;
            let origin = start_offset(stream.start_time(), stream.time_base());
            (stream.index(), stream.time_base(), origin, stream.parameters())
        };

        let decoder = ffmpeg::codec::context::Context::from_parameters(parameters)
            .context("无法创建解码器上下文")?
            .decoder()
            .video()
            .context("无法创建视频解码器")?;

        let scaler = match ffmpeg::software::scaling::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::format::Pixel::RGB24,
            self.config.frame_width,
            self.config.frame_height,
            ffmpeg::software::scaling::Flags::BILINEAR,
        ) {
            Ok(scaler) => Some(scaler),
            Err(e) => {
                warn!("⚠️  [帧采样] 无法创建缩放器，跳过采样: {}", e);
                None
            }
        };

        let times = if scaler.is_some() { self.sample_times() } else { Vec::new() };

        Ok(Frames {
            ictx,
            decoder,
            scaler,
            stream_index,
            time_base,
            origin,
            max_lag: f64::from(self.config.interval_secs) / 2.0,
            jpeg_quality: self.config.jpeg_quality,
            times: times.into_iter(),
        })
    }
}

/// 按时间顺序产出帧的迭代器
pub struct Frames {
    ictx: ffmpeg::format::context::Input,
    decoder: ffmpeg::decoder::Video,
    scaler: Option<ffmpeg::software::scaling::Context>,
    stream_index: usize,
    time_base: ffmpeg::Rational,
    /// 视频流起始时间（秒），采样时间以它为 0 点
    origin: f64,
    /// 文件尾回退帧与目标时间允许的最大差距（半个采样间隔）
    max_lag: f64,
    jpeg_quality: u8,
    times: std::vec::IntoIter<u32>,
}

impl Frames {
    /// 剩余待采样的时间点数量
    pub fn remaining(&self) -> usize {
        self.times.len()
    }

    /// seek 到目标时间，并解码直到解码器落在目标时间上。
    ///
    /// 只有读到文件尾仍未到达目标时，才退回到最后解码出的帧，且该帧距目标不超过半个采样间隔。
    fn capture(&mut self, target: u32) -> Result<Option<ffmpeg::frame::Video>> {
        let target_secs = f64::from(target);
        let (time_base, origin) = (self.time_base, self.origin);
        let timestamp = ((target_secs + origin) * f64::from(ffmpeg::ffi::AV_TIME_BASE)).round() as i64;

        // 向后查找最近的关键帧
        self.ictx
            .seek(timestamp, ..timestamp)
            .with_context(|| format!("seek 到 {}s 失败", target))?;
        self.decoder.flush();

        let mut latest: Option<(f64, ffmpeg::frame::Video)> = None;
        let mut packets_read = 0;

        for (stream, packet) in self.ictx.packets() {
            if stream.index() != self.stream_index {
                continue;
            }

            packets_read += 1;
            if packets_read > MAX_PACKETS_PER_SEEK {
                warn!(
                    "⚠️  [帧采样] {}s 处读取 {} 个数据包后仍未到达目标时间",
                    target, MAX_PACKETS_PER_SEEK
                );
                return Ok(None);
            }

            if self.decoder.send_packet(&packet).is_err() {
                continue;
            }

            let mut decoded = ffmpeg::frame::Video::empty();
            while self.decoder.receive_frame(&mut decoded).is_ok() {
                let frame_time = decoded_seconds(&decoded, time_base, origin, target_secs);
                if frame_time + SEEK_TOLERANCE >= target_secs {
                    return Ok(Some(decoded));
                }
                latest = Some((frame_time, std::mem::replace(&mut decoded, ffmpeg::frame::Video::empty())));
            }
        }

        // 文件尾：冲刷解码器中缓存的帧
        if self.decoder.send_eof().is_ok() {
            let mut decoded = ffmpeg::frame::Video::empty();
            while self.decoder.receive_frame(&mut decoded).is_ok() {
                let frame_time = decoded_seconds(&decoded, time_base, origin, target_secs);
                if frame_time + SEEK_TOLERANCE >= target_secs {
                    return Ok(Some(decoded));
                }
                latest = Some((frame_time, std::mem::replace(&mut decoded, ffmpeg::frame::Video::empty())));
            }
        }

        Ok(latest.and_then(|(frame_time, decoded)| {
            if within_lag(frame_time, target_secs, self.max_lag) {
                Some(decoded)
            } else {
                warn!(
                    "⚠️  [帧采样] {}s 处最后可用的帧在 {:.2}s，相差过大",
                    target, frame_time
                );
                None
            }
        }))
    }
}

impl Iterator for Frames {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        loop {
            let target = self.times.next()?;

            let decoded = match self.capture(target) {
                Ok(Some(decoded)) => decoded,
                Ok(None) => {
                    warn!("⚠️  [帧采样] {}s 处没有解码出任何帧，跳过", target);
                    continue;
                }
                Err(e) => {
                    warn!("⚠️  [帧采样] {}s 处采样失败，跳过: {:#}", target, e);
                    continue;
                }
            };

            let scaler = self.scaler.as_mut()?;
            match render_jpeg(scaler, &decoded, self.jpeg_quality) {
                Ok(image) => {
                    debug!("[帧采样] 已采样 {}s ({} 字节)", target, image.len());
                    return Some(Frame::new(target, image));
                }
                Err(e) => warn!("⚠️  [帧采样] {}s 处图像编码失败，跳过: {:#}", target, e),
            }
        }
    }
}

/// 采样过程中发布的事件
#[derive(Debug)]
pub enum SampleEvent {
    /// 元数据已读取（对应视频 metadata 加载完成）
    Metadata { duration: f64, expected_frames: usize },
    /// 新采样出的一帧
    Frame(Frame),
}

/// 采样统计
#[derive(Debug, Clone)]
pub struct SamplingReport {
    pub duration: f64,
    pub expected_frames: usize,
    pub extracted_frames: usize,
    pub elapsed: Duration,
}

/// 在阻塞线程上采样，逐帧通过通道发布，调用方可以边采样边展示进度
pub async fn stream_frames(
    input_path: impl AsRef<Path>,
    config: SamplerConfig,
    tx: mpsc::Sender<SampleEvent>,
) -> Result<SamplingReport> {
    let input_path = input_path.as_ref().to_path_buf();

    tokio::task::spawn_blocking(move || -> Result<SamplingReport> {
        let start = Instant::now();
        let sampler = FrameSampler::open(&input_path, config)?;
        let duration = sampler.duration();
        let expected_frames = sampler.sample_times().len();

        info!("🎬 [帧采样] 开始采样: {}", input_path.display());
        info!("  • 视频时长: {:.2}秒", duration);
        info!("  • 预计帧数: {} 帧", expected_frames);

        if tx
            .blocking_send(SampleEvent::Metadata { duration, expected_frames })
            .is_err()
        {
            return Ok(SamplingReport {
                duration,
                expected_frames,
                extracted_frames: 0,
                elapsed: start.elapsed(),
            });
        }

        let log_interval = (expected_frames / 10).max(1);
        let mut extracted_frames = 0;

        for frame in sampler.frames()? {
            let time = frame.time;
            if tx.blocking_send(SampleEvent::Frame(frame)).is_err() {
                // 接收方已放弃（例如切换了视频）
                debug!("[帧采样] 接收方已关闭，停止采样");
                break;
            }
            extracted_frames += 1;

            if extracted_frames % log_interval == 0 || extracted_frames == expected_frames {
                let progress = extracted_frames as f64 / expected_frames.max(1) as f64 * 100.0;
                info!(
                    "📈 [帧采样] 进度: {:.0}% ({}/{}) | 当前: {}s",
                    progress, extracted_frames, expected_frames, time
                );
            }
        }

        let elapsed = start.elapsed();
        info!(
            "✅ [帧采样] 采样完成: {} 帧，耗时 {:.2}秒",
            extracted_frames,
            elapsed.as_secs_f64()
        );

        Ok(SamplingReport {
            duration,
            expected_frames,
            extracted_frames,
            elapsed,
        })
    })
    .await
    .context("采样线程异常退出")?
}

fn container_duration(ictx: &ffmpeg::format::context::Input) -> Option<f64> {
    let raw = ictx.duration();
    if raw > 0 {
        Some(raw as f64 / f64::from(ffmpeg::ffi::AV_TIME_BASE))
    } else {
        None
    }
}

/// 流的起始时间（秒）；未知时视为 0
fn start_offset(start_time: i64, time_base: ffmpeg::Rational) -> f64 {
    if start_time == ffmpeg::ffi::AV_NOPTS_VALUE {
        0.0
    } else {
        pts_seconds(start_time, time_base)
    }
}

/// 解码帧相对于流起点的时间（秒），没有时间戳时按目标时间处理
fn decoded_seconds(decoded: &ffmpeg::frame::Video, time_base: ffmpeg::Rational, origin: f64, fallback: f64) -> f64 {
    decoded
        .timestamp()
        .map(|ts| pts_seconds(ts, time_base) - origin)
        .unwrap_or(fallback)
}

fn within_lag(frame_time: f64, target: f64, max_lag: f64) -> bool {
    (target - frame_time).abs() <= max_lag
}

fn pts_seconds(ts: i64, time_base: ffmpeg::Rational) -> f64 {
    if time_base.denominator() == 0 {
        return 0.0;
    }
    ts as f64 * f64::from(time_base.numerator()) / f64::from(time_base.denominator())
}

/// 缩放到目标分辨率并压缩为 JPEG
fn render_jpeg(
    scaler: &mut ffmpeg::software::scaling::Context,
    decoded: &ffmpeg::frame::Video,
    quality: u8,
) -> Result<Vec<u8>> {
    let mut rgb_frame = ffmpeg::frame::Video::empty();
    scaler.run(decoded, &mut rgb_frame).context("帧缩放失败")?;

    let width = rgb_frame.width();
    let height = rgb_frame.height();
    let stride = rgb_frame.stride(0);
    let data = rgb_frame.data(0);
    let row_bytes = width as usize * 3;

    // RGB24 行数据可能带填充，按 stride 逐行拷贝
    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for y in 0..height as usize {
        let start = y * stride;
        let row = data
            .get(start..start + row_bytes)
            .context("帧数据长度不足")?;
        pixels.extend_from_slice(row);
    }

    encode_jpeg(&pixels, width, height, quality)
}

fn encode_jpeg(pixels: &[u8], width: u32, height: u32, quality: u8) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode(pixels, width, height, ColorType::Rgb8)
        .context("JPEG 编码失败")?;
    Ok(out)
}

/// 测试用的小视频：纯色画面，逐帧改变亮度
#[cfg(test)]
pub(crate) mod test_clip {
    use super::ffmpeg;
    use std::path::Path;

    const FPS: i32 = 25;
    const WIDTH: u32 = 320;
    const HEIGHT: u32 = 240;

    /// 用 MPEG-4 编码器写出 `seconds` 秒的 mp4 文件
    pub(crate) fn write_clip(path: &Path, seconds: u32) {
        ffmpeg::init().unwrap();

        let mut octx = ffmpeg::format::output(path).unwrap();
        let codec = ffmpeg::encoder::find(ffmpeg::codec::Id::MPEG4).unwrap();
        let global_header = octx.format().flags().contains(ffmpeg::format::Flags::GLOBAL_HEADER);

        let mut encoder = ffmpeg::codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()
            .unwrap();
        encoder.set_width(WIDTH);
        encoder.set_height(HEIGHT);
        encoder.set_format(ffmpeg::format::Pixel::YUV420P);
        encoder.set_time_base((1, FPS));
        encoder.set_frame_rate(Some((FPS, 1)));
        encoder.set_gop(FPS as u32);
        if global_header {
            encoder.set_flags(ffmpeg::codec::Flags::GLOBAL_HEADER);
        }
        let mut encoder = encoder.open_as(codec).unwrap();

        {
            let mut ost = octx.add_stream(codec).unwrap();
            ost.set_parameters(&encoder);
            ost.set_time_base((1, FPS));
        }
        octx.write_header().unwrap();
        let ost_time_base = octx.stream(0).unwrap().time_base();

        for index in 0..(seconds as i64 * i64::from(FPS)) {
            let mut frame = ffmpeg::frame::Video::new(ffmpeg::format::Pixel::YUV420P, WIDTH, HEIGHT);
            frame.data_mut(0).fill((index % 200) as u8 + 16);
            frame.data_mut(1).fill(128);
            frame.data_mut(2).fill(128);
            frame.set_pts(Some(index));
            encoder.send_frame(&frame).unwrap();
            write_packets(&mut encoder, &mut octx, ost_time_base);
        }
        encoder.send_eof().unwrap();
        write_packets(&mut encoder, &mut octx, ost_time_base);
        octx.write_trailer().unwrap();
    }

    fn write_packets(
        encoder: &mut ffmpeg::encoder::Encoder,
        octx: &mut ffmpeg::format::context::Output,
        time_base: ffmpeg::Rational,
    ) {
        let mut packet = ffmpeg::Packet::empty();
        while encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(0);
            packet.rescale_ts((1, FPS), time_base);
            packet.write_interleaved(octx).unwrap();
        }
    }
}
