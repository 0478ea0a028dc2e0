mod assembly;
mod neighbor;
