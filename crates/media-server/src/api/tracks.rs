//! Track info, favorites, and on-demand transcoded streams.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use actix_web::{HttpResponse, Responder, get, post, web};
use audio_pipeline::duration::parse_duration;
use audio_pipeline::encode::{Codec, SinkConfig, new_sink};
use audio_pipeline::format::{ChannelLayout, SampleFormat};
use audio_pipeline::fragment::open_source;
use audio_pipeline::replaygain::ReplayGainMode;
use audio_pipeline::transcode::{StreamOptions, Transcoder};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use super::{ChannelWriter, audio_response, body_channel, json_response};
use crate::error::StreamError;
use crate::library::{clean_library_path, parse_at};
use crate::state::AppState;

/// Raw query parameters of a stream request.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamQuery {
    pub codec: Option<String>,
    pub quality: Option<String>,
    pub kbit_rate: Option<String>,
    pub bit_rate: Option<String>,
    pub sample_rate: Option<String>,
    pub sample_format: Option<String>,
    pub channel_layout: Option<String>,
    pub replay_gain: Option<String>,
    pub prevent_clipping: Option<String>,
    pub start_time: Option<String>,
}

/// Validated stream parameters.
#[derive(Debug, PartialEq)]
pub(crate) struct StreamRequest {
    codec: Codec,
    quality: Option<f32>,
    /// kbit/s.
    kbit_rate: Option<u32>,
    sample_rate: Option<u32>,
    sample_format: Option<SampleFormat>,
    channel_layout: Option<ChannelLayout>,
    /// `None` disables ReplayGain.
    replay_gain: Option<ReplayGainMode>,
    prevent_clipping: bool,
    start_time: Duration,
}

impl StreamQuery {
    pub(crate) fn parse(&self) -> Result<StreamRequest, StreamError> {
        let replay_gain = match self.replay_gain.as_deref() {
            None => Some(ReplayGainMode::Track),
            Some("off") => None,
            Some(mode) => Some(parse_param("replayGain", mode)?),
        };
        let start_time = match self.start_time.as_deref() {
            None => Duration::ZERO,
            Some(value) => parse_duration(value).map_err(|e| {
                StreamError::bad_request(format!("invalid start time {value:?}: {e}"))
            })?,
        };

        Ok(StreamRequest {
            codec: optional_param("codec", &self.codec)?.unwrap_or_default(),
            quality: optional_param("quality", &self.quality)?,
            kbit_rate: match optional_param("kbitRate", &self.kbit_rate)? {
                Some(rate) => Some(rate),
                None => optional_param("bitRate", &self.bit_rate)?,
            },
            sample_rate: match optional_param("sampleRate", &self.sample_rate)? {
                Some(0) => return Err(StreamError::bad_request("sampleRate must be positive")),
                rate => rate,
            },
            sample_format: optional_param("sampleFormat", &self.sample_format)?,
            channel_layout: optional_param("channelLayout", &self.channel_layout)?,
            replay_gain,
            prevent_clipping: match self.prevent_clipping.as_deref() {
                None => true,
                Some(value) => parse_bool(value).ok_or_else(|| {
                    StreamError::bad_request(format!("invalid value for preventClipping: {value:?}"))
                })?,
            },
            start_time,
        })
    }
}

fn parse_param<T>(name: &str, value: &str) -> Result<T, StreamError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| StreamError::bad_request(format!("invalid {name} {value:?}: {e}")))
}

fn optional_param<T>(name: &str, value: &Option<String>) -> Result<Option<T>, StreamError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.as_deref().map(|v| parse_param(name, v)).transpose()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

/// Resolve an `at:` track id to its library path and file.
pub(crate) fn resolve_track(state: &AppState, id: &str) -> Result<(String, PathBuf), StreamError> {
    let not_found = || StreamError::NotFound(format!("no such track: {id}"));
    let library_path = parse_at(id)
        .and_then(|path| clean_library_path(&path))
        .ok_or_else(not_found)?;
    let fs_path = state.library.track_path(&library_path).ok_or_else(not_found)?;
    Ok((library_path, fs_path))
}

/// Open the source and build the pipeline for one request.
fn open_stream(
    path: &Path,
    request: &StreamRequest,
    options: &StreamOptions,
) -> Result<Transcoder, StreamError> {
    let mut source = open_source(path)?;

    let volume = request
        .replay_gain
        .map_or(1.0, |mode| source.replay_gain(mode, request.prevent_clipping))
        // Only boosts are applied server-side.
        .max(1.0);

    if !request.start_time.is_zero() {
        if let Err(e) = source.seek_to(request.start_time) {
            tracing::error!(error = %format!("{e:#}"), "seek failed");
        }
    }

    let info = source.stream_info();
    let config = SinkConfig {
        codec: request.codec,
        sample_rate: request.sample_rate.unwrap_or(info.sample_rate),
        sample_format: request.sample_format.unwrap_or(info.sample_format),
        channel_layout: request.channel_layout.unwrap_or(info.channel_layout),
        quality: request.quality,
        bit_rate: request.kbit_rate.map(|kbps| kbps.saturating_mul(1000)),
        deterministic: options.deterministic,
    };
    let sink = new_sink(&config).map_err(|e| StreamError::internal("failed to create sink", &e))?;
    Transcoder::new(source, sink, volume)
        .map_err(|e| StreamError::internal("failed to set up resampler", &e))
}

/// Stream thread body: report setup, then transcode until done or disconnected.
fn run_stream(
    path: PathBuf,
    request: StreamRequest,
    options: StreamOptions,
    mut writer: ChannelWriter,
    ready: oneshot::Sender<Result<Codec, StreamError>>,
) {
    let transcoder = match open_stream(&path, &request, &options) {
        Ok(transcoder) => transcoder,
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };
    let info = transcoder.sink_info();
    if ready.send(Ok(request.codec)).is_err() {
        return;
    }

    tracing::info!(path = %path.display(), codec = %request.codec, %info, "stream started");
    match transcoder.run(&mut writer, &options) {
        Ok(summary) => tracing::info!(
            path = %path.display(),
            samples = summary.samples,
            bytes = summary.bytes,
            completed = summary.completed,
            "stream finished"
        ),
        Err(e) => tracing::error!(path = %path.display(), error = %format!("{e:#}"), "stream failed"),
    }
}

#[get("/media/tracks/{track}/stream")]
/// Transcode a track and stream it at playback speed.
pub async fn track_stream(
    state: web::Data<AppState>,
    track: web::Path<String>,
    query: web::Query<StreamQuery>,
) -> impl Responder {
    let (_, fs_path) = match resolve_track(&state, &track) {
        Ok(resolved) => resolved,
        Err(err) => return err.into_response(),
    };
    let request = match query.parse() {
        Ok(request) => request,
        Err(err) => return err.into_response(),
    };

    let options = state.streaming.clone();
    let (writer, body) = body_channel();
    let (ready_tx, ready_rx) = oneshot::channel();
    let spawned = std::thread::Builder::new()
        .name("stream".to_string())
        .spawn(move || run_stream(fs_path, request, options, writer, ready_tx));
    if let Err(e) = spawned {
        return StreamError::Internal(format!("failed to spawn stream thread: {e}")).into_response();
    }

    match ready_rx.await {
        Ok(Ok(codec)) => audio_response(codec.mime_type(), body),
        Ok(Err(err)) => err.into_response(),
        Err(_) => StreamError::Internal("stream thread exited during setup".to_string())
            .into_response(),
    }
}

/// Metadata returned by the track info endpoint.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    pub name: String,
    /// Seconds.
    pub duration: f64,
    pub replay_gain_track: f64,
    pub replay_gain_album: f64,
    pub favorite: bool,
    pub tags: BTreeMap<String, String>,
    pub sample_rate: u32,
    pub sample_format: String,
}

fn read_track_info(path: &Path) -> Result<TrackInfo, StreamError> {
    let source = open_source(path)?;
    let info = source.stream_info();
    Ok(TrackInfo {
        name: path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default(),
        duration: source.duration().as_secs_f64(),
        replay_gain_track: source.replay_gain(ReplayGainMode::Track, true),
        replay_gain_album: source.replay_gain(ReplayGainMode::Album, true),
        favorite: false,
        tags: source
            .tags()
            .iter()
            .map(|(key, value)| (key.to_lowercase(), value.clone()))
            .collect(),
        sample_rate: info.sample_rate,
        sample_format: info.sample_format.name().to_string(),
    })
}

#[get("/media/tracks/{track}")]
/// Describe a track.
pub async fn track_info(state: web::Data<AppState>, track: web::Path<String>) -> impl Responder {
    let (library_path, fs_path) = match resolve_track(&state, &track) {
        Ok(resolved) => resolved,
        Err(err) => return err.into_response(),
    };

    let mut info = match web::block(move || read_track_info(&fs_path)).await {
        Ok(Ok(info)) => info,
        Ok(Err(err)) => return err.into_response(),
        Err(e) => return StreamError::Internal(format!("track info task failed: {e}")).into_response(),
    };
    match state.library.is_favorite(&library_path) {
        Ok(favorite) => info.favorite = favorite,
        Err(e) => tracing::error!(error = %format!("{e:#}"), "failed to read favorites"),
    }
    json_response(&info)
}

fn favorite_response(state: &AppState, id: &str, favorite: bool) -> HttpResponse {
    let (library_path, _) = match resolve_track(state, id) {
        Ok(resolved) => resolved,
        Err(err) => return err.into_response(),
    };
    match state.library.set_favorite(&library_path, favorite) {
        Ok(()) => json_response(&()),
        Err(e) => StreamError::internal("failed to update favorites", &e).into_response(),
    }
}

#[post("/media/tracks/{track}/favorite")]
/// Add a track to the favorites playlist.
pub async fn track_favorite(state: web::Data<AppState>, track: web::Path<String>) -> impl Responder {
    favorite_response(&state, &track, true)
}

#[post("/media/tracks/{track}/unfavorite")]
/// Remove a track from the favorites playlist.
pub async fn track_unfavorite(state: web::Data<AppState>, track: web::Path<String>) -> impl Responder {
    favorite_response(&state, &track, false)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use actix_web::http::{StatusCode, header};
    use actix_web::{App, test};
    use audio_pipeline::encode::wav;
    use audio_pipeline::format::StreamInfo;
    use audio_pipeline::player::Player;

    use super::*;
    use crate::library::Library;
    use crate::library::tests::temp_dir;

    /// Write an s16 mono WAV of `samples` at `rate`.
    pub(crate) fn write_tone(path: &Path, rate: u32, samples: usize) {
        let info = StreamInfo::new(rate, SampleFormat::S16, ChannelLayout::MONO);
        let data: Vec<u8> = (0..samples)
            .flat_map(|n| (((n % 100) as i16 - 50) * 100).to_le_bytes())
            .collect();
        let mut bytes = wav::header(info, Some(data.len() as u32));
        bytes.extend_from_slice(&data);
        std::fs::write(path, bytes).unwrap();
    }

    pub(crate) fn test_state(root: &Path) -> web::Data<AppState> {
        let library = Library::open(root, &root.join(".storage")).unwrap();
        let streaming = StreamOptions {
            throttle: false,
            deterministic: true,
            ..StreamOptions::default()
        };
        web::Data::new(AppState::new(library, Arc::new(Player::default()), streaming))
    }

    fn query(pairs: &str) -> StreamQuery {
        serde_json::from_str(pairs).unwrap()
    }

    #[::core::prelude::v1::test]
    fn query_defaults_to_track_gain_wav() {
        let request = StreamQuery::default().parse().unwrap();
        assert_eq!(request.codec, Codec::Wav);
        assert_eq!(request.replay_gain, Some(ReplayGainMode::Track));
        assert!(request.prevent_clipping);
        assert_eq!(request.start_time, Duration::ZERO);
        assert_eq!(request.kbit_rate, None);
    }

    #[::core::prelude::v1::test]
    fn query_parses_every_parameter() {
        let request = query(
            r#"{"codec":"vorbis","quality":"4.5","bitRate":"96","sampleRate":"48000",
                "sampleFormat":"fltp","channelLayout":"mono","replayGain":"off",
                "preventClipping":"F","startTime":"1m30s"}"#,
        )
        .parse()
        .unwrap();
        assert_eq!(request.codec, Codec::Vorbis);
        assert_eq!(request.quality, Some(4.5));
        assert_eq!(request.kbit_rate, Some(96));
        assert_eq!(request.sample_rate, Some(48_000));
        assert_eq!(request.sample_format, Some(SampleFormat::F32));
        assert_eq!(request.channel_layout, Some(ChannelLayout::MONO));
        assert_eq!(request.replay_gain, None);
        assert!(!request.prevent_clipping);
        assert_eq!(request.start_time, Duration::from_secs(90));
    }

    #[::core::prelude::v1::test]
    fn kbit_rate_wins_over_bit_rate() {
        let request = query(r#"{"kbitRate":"320","bitRate":"96"}"#).parse().unwrap();
        assert_eq!(request.kbit_rate, Some(320));
    }

    #[::core::prelude::v1::test]
    fn query_rejects_invalid_values() {
        for bad in [
            r#"{"codec":"aac"}"#,
            r#"{"quality":"loud"}"#,
            r#"{"kbitRate":"-5"}"#,
            r#"{"sampleRate":"44.1k"}"#,
            r#"{"sampleRate":"0"}"#,
            r#"{"sampleFormat":"s24"}"#,
            r#"{"channelLayout":"surround"}"#,
            r#"{"replayGain":"loudest"}"#,
            r#"{"preventClipping":"maybe"}"#,
            r#"{"startTime":"-1s"}"#,
            r#"{"startTime":"soon"}"#,
        ] {
            assert!(
                matches!(query(bad).parse(), Err(StreamError::BadRequest(_))),
                "accepted {bad}"
            );
        }
    }

    #[actix_web::test]
    async fn streams_wav_with_every_sample() {
        let root = temp_dir("tracks-stream");
        write_tone(&root.join("tone.wav"), 8_000, 8_000);
        let state = test_state(&root);
        let app = test::init_service(App::new().app_data(state.clone()).service(track_stream)).await;

        let req = test::TestRequest::get()
            .uri("/media/tracks/at:tone.wav/stream?codec=wav&replayGain=off")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get(header::CONTENT_TYPE).unwrap(), "audio/wav");
        assert_eq!(
            resp.headers().get(header::CACHE_CONTROL).unwrap(),
            "no-cache, no-store"
        );

        let body = test::read_body(resp).await;
        assert_eq!(&body[..4], b"RIFF");
        assert_eq!(body.len(), 44 + 8_000 * 2);
        let _ = std::fs::remove_dir_all(root);
    }

    #[actix_web::test]
    async fn start_time_skips_into_the_track() {
        let root = temp_dir("tracks-seek");
        write_tone(&root.join("tone.wav"), 8_000, 16_000);
        let state = test_state(&root);
        let app = test::init_service(App::new().app_data(state.clone()).service(track_stream)).await;

        let req = test::TestRequest::get()
            .uri("/media/tracks/at:tone.wav/stream?startTime=1s")
            .to_request();
        let body = test::call_and_read_body(&app, req).await;
        let samples = (body.len() - 44) / 2;
        assert!((6_000..=10_000).contains(&samples), "streamed {samples} samples");
        let _ = std::fs::remove_dir_all(root);
    }

    #[actix_web::test]
    async fn stream_errors_map_to_statuses() {
        let root = temp_dir("tracks-errors");
        write_tone(&root.join("tone.wav"), 8_000, 8_000);
        std::fs::write(root.join("tone.wav.1.txt"), "start 2s\nend 1s\n").unwrap();
        std::fs::write(root.join("broken.wav"), b"not audio").unwrap();
        let state = test_state(&root);
        let app = test::init_service(App::new().app_data(state.clone()).service(track_stream)).await;

        for (uri, status) in [
            ("/media/tracks/at:tone.wav/stream?codec=aac", StatusCode::BAD_REQUEST),
            ("/media/tracks/at:tone.wav/stream?startTime=-2s", StatusCode::BAD_REQUEST),
            ("/media/tracks/at:tone.wav/stream?sampleRate=0", StatusCode::BAD_REQUEST),
            ("/media/tracks/at:tone.wav.1.txt/stream", StatusCode::BAD_REQUEST),
            ("/media/tracks/at:missing.wav/stream", StatusCode::NOT_FOUND),
            ("/media/tracks/at:..%2Fescape.wav/stream", StatusCode::NOT_FOUND),
            ("/media/tracks/tone.wav/stream", StatusCode::NOT_FOUND),
            ("/media/tracks/at:broken.wav/stream", StatusCode::NOT_FOUND),
        ] {
            let req = test::TestRequest::get().uri(uri).to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), status, "{uri}");
        }
        let _ = std::fs::remove_dir_all(root);
    }

    #[actix_web::test]
    async fn track_info_reports_stream_and_favorite() {
        let root = temp_dir("tracks-info");
        write_tone(&root.join("tone.wav"), 8_000, 4_000);
        let state = test_state(&root);
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .service(track_info)
                .service(track_favorite)
                .service(track_unfavorite),
        )
        .await;

        let req = test::TestRequest::get().uri("/media/tracks/at:tone.wav").to_request();
        let info: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(info["name"], "tone.wav");
        assert_eq!(info["sampleRate"], 8_000);
        assert_eq!(info["sampleFormat"], "s16");
        assert_eq!(info["favorite"], false);
        assert_eq!(info["replayGainTrack"], 1.0);
        assert!((info["duration"].as_f64().unwrap() - 0.5).abs() < 0.01);

        for _ in 0..2 {
            let req = test::TestRequest::post()
                .uri("/media/tracks/at:tone.wav/favorite")
                .to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::OK);
        }
        let req = test::TestRequest::get().uri("/media/tracks/at:tone.wav").to_request();
        let info: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(info["favorite"], true);
        assert_eq!(state.library.favorites().unwrap().0.len(), 1);

        let req = test::TestRequest::post()
            .uri("/media/tracks/at:tone.wav/unfavorite")
            .to_request();
        test::call_service(&app, req).await;
        assert!(!state.library.is_favorite("tone.wav").unwrap());

        let req = test::TestRequest::post()
            .uri("/media/tracks/at:missing.wav/favorite")
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);
        let _ = std::fs::remove_dir_all(root);
    }
}
