mod completion;
mod helpers;
