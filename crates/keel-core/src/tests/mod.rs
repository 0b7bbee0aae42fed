mod backup;
mod catalog;
