mod helpers;
mod supervision;
