pub mod chart;
pub mod error;

pub use chart::bars::{fold_observation, next_bar_time};
pub use chart::pipeline::{
    redraw_instrument, run_chart_stream, start_chart_stream, ChartStreamHandle, SharedRouter,
    SharedStatus,
};
pub use chart::router::EventRouter;
pub use chart::subscriptions::{BarHandler, Subscription, SubscriptionTable};
pub use chart::types::{
    Bar, BarUpdate, CurveSnapshot, Direction, FeedConnectionState, FeedEvent, FeedStatusSnapshot,
    PriceObservation, Resolution, SeriesKey, StartStreamArgs, StreamConfig,
};
pub use error::FeedError;
